//! Wheel position sources.
//!
//! The trial machine and the fixed-rate recorder read the same counter from
//! different threads; only the encoder edge handler writes it.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Rotary encoder ticks per degree of wheel rotation.
pub const TICKS_PER_DEGREE: f64 = 1024.0 / 360.0;

pub trait PositionSource: Send + Sync {
    fn position(&self) -> i64;
}

impl<P: PositionSource + ?Sized> PositionSource for Arc<P> {
    fn position(&self) -> i64 {
        (**self).position()
    }
}

/// Lock-free quadrature counter shared between the edge handler and readers.
#[derive(Debug, Default)]
pub struct SharedEncoder {
    steps: AtomicI64,
    last_state: AtomicU8,
}

impl SharedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a signed number of steps.
    pub fn step(&self, delta: i64) {
        self.steps.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.steps.store(value, Ordering::Relaxed);
    }

    /// Feed one A/B pin transition. Invalid (skipped) transitions are ignored.
    pub fn on_edge(&self, a: bool, b: bool) {
        let new = ((a as u8) << 1) | b as u8;
        let old = self.last_state.swap(new, Ordering::Relaxed);
        // Gray-code order 00 -> 01 -> 11 -> 10 is clockwise.
        let delta = match (old, new) {
            (0b00, 0b01) | (0b01, 0b11) | (0b11, 0b10) | (0b10, 0b00) => 1,
            (0b00, 0b10) | (0b10, 0b11) | (0b11, 0b01) | (0b01, 0b00) => -1,
            _ => 0,
        };
        if delta != 0 {
            self.step(delta);
        }
    }
}

impl PositionSource for SharedEncoder {
    fn position(&self) -> i64 {
        self.steps.load(Ordering::Relaxed)
    }
}

/// Position trace driven by a clock: a step function of time.
pub struct ScriptedPosition<C: Clock> {
    clock: C,
    initial: i64,
    steps: Vec<(Duration, i64)>,
}

impl<C: Clock> ScriptedPosition<C> {
    pub fn new(clock: C, initial: i64) -> Self {
        Self {
            clock,
            initial,
            steps: Vec::new(),
        }
    }

    /// From `at` onward the position reads `pos`.
    pub fn then(mut self, at: Duration, pos: i64) -> Self {
        self.steps.push((at, pos));
        self.steps.sort_by_key(|(t, _)| *t);
        self
    }
}

impl<C: Clock> PositionSource for ScriptedPosition<C> {
    fn position(&self) -> i64 {
        let now = self.clock.now();
        self.steps
            .iter()
            .take_while(|(at, _)| *at <= now)
            .last()
            .map(|(_, p)| *p)
            .unwrap_or(self.initial)
    }
}

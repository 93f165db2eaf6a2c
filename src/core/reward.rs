//! Reward pump.
//!
//! Volume is controlled only by how long the pump pin is held high; the
//! calibration constant converts µl to ms. The per-reward duration is chosen
//! once at session start from the previous day's pump log.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::error::Result;
use crate::event_log::CsvLog;

/// Consumption above which the next session's reward shrinks, µl.
pub const DAILY_VOLUME_TARGET_UL: f64 = 1000.0;

pub trait OutputPin: Send {
    fn set_high(&mut self);
    fn set_low(&mut self);
}

impl<P: OutputPin + ?Sized> OutputPin for Box<P> {
    fn set_high(&mut self) {
        (**self).set_high()
    }

    fn set_low(&mut self) {
        (**self).set_low()
    }
}

pub fn volume_to_ms(volume_ul: f64, ms_per_ul: f64) -> f64 {
    volume_ul * ms_per_ul
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpBounds {
    pub max_ms: f64,
    pub min_ms: f64,
}

impl PumpBounds {
    /// From the `[max, min]` µl reward sizes of the task preferences.
    pub fn from_reward_size(reward_size: [f64; 2], ms_per_ul: f64) -> Self {
        Self {
            max_ms: volume_to_ms(reward_size[0], ms_per_ul),
            min_ms: volume_to_ms(reward_size[1], ms_per_ul),
        }
    }

    pub fn clamp(&self, ms: f64) -> f64 {
        ms.max(self.min_ms).min(self.max_ms)
    }
}

/// Next session's pump duration from the previous day's per-reward durations.
///
/// Uniform durations mean no in-session adaptation happened: step by a tenth
/// of a µl down when more than [`DAILY_VOLUME_TARGET_UL`] was consumed, up
/// otherwise. Non-uniform durations keep the smallest value seen. `None` when
/// there is no record.
pub fn adapt_pump_duration(previous: &[f64], ms_per_ul: f64, bounds: PumpBounds) -> Option<f64> {
    let min = previous.iter().copied().reduce(f64::min)?;
    let max = previous.iter().copied().reduce(f64::max)?;
    if max != min {
        return Some(min);
    }
    let volume = previous.iter().sum::<f64>() / ms_per_ul;
    let step = ms_per_ul / 10.0;
    let next = if volume > DAILY_VOLUME_TARGET_UL {
        min - step
    } else {
        min + step
    };
    Some(bounds.clamp(next))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpRecord {
    pub time: f64,
    pub pump_duration: u64,
}

pub fn read_pump_log(path: &Path) -> Result<Vec<PumpRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Sole owner of the pump pin.
pub struct RewardActuator {
    pin: Box<dyn OutputPin>,
    ms_per_ul: f64,
    duration_ms: f64,
    log: Option<CsvLog<PumpRecord>>,
}

impl RewardActuator {
    pub fn new(pin: Box<dyn OutputPin>, ms_per_ul: f64, duration_ms: f64, log: Option<CsvLog<PumpRecord>>) -> Self {
        info!(
            pump_duration_ms = duration_ms,
            volume_ul = duration_ms / ms_per_ul,
            "reward actuator ready"
        );
        Self {
            pin,
            ms_per_ul,
            duration_ms,
            log,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn ms_per_ul(&self) -> f64 {
        self.ms_per_ul
    }

    pub fn volume_to_ms(&self, volume_ul: f64) -> f64 {
        volume_to_ms(volume_ul, self.ms_per_ul)
    }

    /// Open the pump for the standard duration times `multiplier` and return
    /// the actuation time in ms.
    pub fn dispense<C: Clock + ?Sized>(&mut self, clock: &C, multiplier: u32) -> Result<u64> {
        let ms = (self.duration_ms * multiplier as f64) as u64;
        self.pin.set_high();
        let logged = match self.log.as_mut() {
            Some(log) => log.append(&PumpRecord {
                time: clock.wall_secs(),
                pump_duration: ms,
            }),
            None => Ok(()),
        };
        clock.sleep(Duration::from_millis(ms));
        self.pin.set_low();
        logged?;
        Ok(ms)
    }

    /// Dispense a volume given in µl, bypassing the adaptive duration.
    pub fn dispense_volume<C: Clock + ?Sized>(&mut self, clock: &C, volume_ul: f64) -> Result<u64> {
        let standard = self.duration_ms;
        self.duration_ms = self.volume_to_ms(volume_ul);
        let out = self.dispense(clock, 1);
        self.duration_ms = standard;
        out
    }
}

//! Dry-run hardware.
//!
//! GPIO and sound-card drivers live outside this workspace. The daemon wires
//! a session to stand-ins instead: pins that log their transitions, a sync
//! input that toggles at the configured frame rate, a silent audio sink, and
//! an optional simulated animal that turns the wheel now and then.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, trace};
use wheelrig::audio::SilentAudio;
use wheelrig::clock::{Clock, SystemClock};
use wheelrig::config::RigSettings;
use wheelrig::position::SharedEncoder;
use wheelrig::prng::TaskRng;
use wheelrig::recorder::InputPin;
use wheelrig::reward::OutputPin;
use wheelrig::session::RigHardware;

use crate::DriverError;

/// Output pin that only reports its transitions.
#[derive(Debug)]
pub struct LoggedPin {
    role: &'static str,
    pin: Option<u32>,
    high: bool,
}

impl LoggedPin {
    pub fn new(role: &'static str, settings: &RigSettings) -> Self {
        let pin = settings.pin_map.outputs.get(role).copied();
        if pin.is_none() {
            debug!(role, "no output pin mapped");
        }
        Self { role, pin, high: false }
    }
}

impl OutputPin for LoggedPin {
    fn set_high(&mut self) {
        if !self.high {
            trace!(role = self.role, pin = ?self.pin, "high");
        }
        self.high = true;
    }

    fn set_low(&mut self) {
        if self.high {
            trace!(role = self.role, pin = ?self.pin, "low");
        }
        self.high = false;
    }
}

/// Square-wave input standing in for the imaging frame clock.
pub struct ClockedInput {
    clock: Arc<dyn Clock>,
    half_period: f64,
}

impl ClockedInput {
    pub fn new(clock: Arc<dyn Clock>, rate_hz: f64) -> Self {
        Self {
            clock,
            half_period: 0.5 / rate_hz,
        }
    }
}

impl InputPin for ClockedInput {
    fn is_high(&self) -> bool {
        let phase = (self.clock.now().as_secs_f64() / self.half_period) as u64;
        phase % 2 == 1
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Simulated animal
// ─────────────────────────────────────────────────────────────────────────

/// How the simulated animal moves the wheel.
#[derive(Debug, Clone, Copy)]
pub struct AnimalModel {
    /// Mean rest between movements, seconds.
    pub mean_rest: f64,
    /// Size of one movement, encoder ticks.
    pub reach: i64,
    /// Duration of one movement.
    pub sweep: Duration,
}

impl Default for AnimalModel {
    fn default() -> Self {
        Self {
            mean_rest: 2.0,
            reach: 120,
            sweep: Duration::from_millis(150),
        }
    }
}

/// Thread that turns the shared encoder at random intervals and directions.
pub struct SimulatedAnimal {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<u64>,
}

impl SimulatedAnimal {
    pub fn spawn(
        encoder: Arc<SharedEncoder>,
        clock: Arc<dyn Clock>,
        model: AnimalModel,
        mut rng: TaskRng,
    ) -> Result<Self, DriverError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("simulated-animal".into())
            .spawn(move || {
                const STEPS: u32 = 10;
                let mut moves = 0u64;
                while !flag.load(Ordering::SeqCst) {
                    let rest = Duration::from_secs_f64(rng.exponential(model.mean_rest).min(10.0));
                    let until = clock.now() + rest;
                    while clock.now() < until && !flag.load(Ordering::SeqCst) {
                        clock.sleep(Duration::from_millis(20));
                    }
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let step = i64::from(rng.sign()) * (model.reach / i64::from(STEPS)).max(1);
                    for _ in 0..STEPS {
                        encoder.step(step);
                        clock.sleep(model.sweep / STEPS);
                    }
                    moves += 1;
                }
                moves
            })?;
        info!(?model, "simulated animal started");
        Ok(Self { stop, thread })
    }

    /// Stop the animal and return how many movements it made.
    pub fn stop(self) -> Result<u64, DriverError> {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.join().map_err(|_| DriverError::Join("simulated-animal"))
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────

pub struct DryRig {
    pub encoder: Arc<SharedEncoder>,
    pub clock: Arc<dyn Clock>,
}

impl DryRig {
    pub fn new() -> Self {
        Self {
            encoder: Arc::new(SharedEncoder::new()),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Handles for one session. Every call shares the same encoder and clock.
    pub fn hardware(&self, settings: &RigSettings) -> RigHardware {
        RigHardware {
            position: self.encoder.clone(),
            clock: Arc::clone(&self.clock),
            audio: Box::new(SilentAudio::new()),
            pump_pin: Box::new(LoggedPin::new("pump", settings)),
        }
    }
}

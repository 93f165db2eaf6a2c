//! Fixed-rate loops that run beside the trial machine.
//!
//! Each recorder is a thread owning its own CSV file. The only state shared
//! with the trial loop is the read-only position counter.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Result, RigError};
use crate::event_log::CsvLog;
use crate::position::PositionSource;
use crate::reward::OutputPin;

pub trait InputPin: Send {
    fn is_high(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub time: f64,
    pub position: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseEdge {
    pub time: f64,
    pub level: bool,
}

/// A running recorder; dropping it without [`RecorderHandle::stop`] leaves
/// the thread running until the process exits.
pub struct RecorderHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<u64>>,
}

impl RecorderHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the loop and return the number of rows it wrote.
    pub fn stop(self) -> Result<u64> {
        self.stop.store(true, Ordering::SeqCst);
        let rows = self
            .thread
            .join()
            .map_err(|_| RigError::ThreadPanicked(self.name))??;
        info!(recorder = self.name, rows, "recorder stopped");
        Ok(rows)
    }
}

fn period(rate_hz: f64) -> Result<Duration> {
    if !(rate_hz > 0.0) {
        return Err(RigError::Config {
            path: Default::default(),
            reason: format!("recorder rate must be positive, got {rate_hz}"),
        });
    }
    Ok(Duration::from_secs_f64(1.0 / rate_hz))
}

/// Run `tick` every `period` until stopped. Missed deadlines are not caught
/// up; the next tick is scheduled one period after the late one.
fn spawn_loop<F>(
    name: &'static str,
    clock: Arc<dyn Clock>,
    period: Duration,
    mut tick: F,
) -> Result<RecorderHandle>
where
    F: FnMut(&dyn Clock) -> Result<u64> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let thread = std::thread::Builder::new().name(name.into()).spawn(move || -> Result<u64> {
        let mut rows = 0u64;
        let mut next = clock.now();
        while !flag.load(Ordering::SeqCst) {
            rows += tick(&*clock)?;
            next += period;
            let now = clock.now();
            if next > now {
                clock.sleep(next - now);
            } else {
                next = now;
            }
        }
        Ok(rows)
    })?;
    debug!(recorder = name, ?period, "recorder started");
    Ok(RecorderHandle { name, stop, thread })
}

/// Log the raw encoder value at `rate_hz`.
pub fn spawn_position_recorder(
    position: Arc<dyn PositionSource>,
    clock: Arc<dyn Clock>,
    rate_hz: f64,
    path: &Path,
) -> Result<RecorderHandle> {
    let mut log = CsvLog::<PositionSample>::create(path)?;
    spawn_loop("position-recorder", clock, period(rate_hz)?, move |clock| {
        log.append(&PositionSample {
            time: clock.wall_secs(),
            position: position.position(),
        })?;
        Ok(1)
    })
}

/// Sample an input pin at `rate_hz` and log every level change.
pub fn spawn_sync_recorder(
    pin: Box<dyn InputPin>,
    clock: Arc<dyn Clock>,
    rate_hz: f64,
    path: &Path,
) -> Result<RecorderHandle> {
    let mut log = CsvLog::<PulseEdge>::create(path)?;
    let mut last = None;
    spawn_loop("sync-recorder", clock, period(rate_hz)?, move |clock| {
        let level = pin.is_high();
        if last == Some(level) {
            return Ok(0);
        }
        last = Some(level);
        log.append(&PulseEdge {
            time: clock.wall_secs(),
            level,
        })?;
        Ok(1)
    })
}

/// Square wave on `pin` at `rate_hz` (camera frame trigger); each rising
/// edge is logged.
pub fn spawn_trigger_pulses(
    mut pin: Box<dyn OutputPin>,
    clock: Arc<dyn Clock>,
    rate_hz: f64,
    path: &Path,
) -> Result<RecorderHandle> {
    let mut log = CsvLog::<PulseEdge>::create(path)?;
    let full = period(rate_hz)?;
    let half = full / 2;
    spawn_loop("camera-trigger", clock, full, move |clock| {
        pin.set_high();
        let logged = log.append(&PulseEdge {
            time: clock.wall_secs(),
            level: true,
        });
        clock.sleep(half);
        pin.set_low();
        logged?;
        Ok(1)
    })
}

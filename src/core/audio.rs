//! Audio output contract.
//!
//! A device streams a precomputed buffer on its own schedule until the trial
//! raises the cancel flag, and plays short buffers (punishment tones) to
//! completion. Real drivers live outside this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, RigError};

/// Stop signal shared between the trial machine and a stream callback.
#[derive(Debug, Clone, Default)]
pub struct CancelAudio(Arc<AtomicBool>);

impl CancelAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub trait AudioOutput: Send {
    /// Begin looping `buffer` until `cancel` is raised. Must not block.
    fn start_stream(&mut self, buffer: Arc<[i16]>, sample_rate: u32, cancel: CancelAudio) -> Result<()>;

    /// Wait for a cancelled stream to wind down.
    fn finish_stream(&mut self) -> Result<()>;

    /// Play `samples` once and return when done.
    fn play_blocking(&mut self, samples: &[i16], sample_rate: u32) -> Result<()>;
}

fn buffer_period(len: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(len as f64 / sample_rate as f64)
}

/// Output sink for dry runs: paces callbacks in real time but emits nothing.
#[derive(Debug, Default)]
pub struct SilentAudio {
    worker: Option<JoinHandle<u64>>,
}

impl SilentAudio {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioOutput for SilentAudio {
    fn start_stream(&mut self, buffer: Arc<[i16]>, sample_rate: u32, cancel: CancelAudio) -> Result<()> {
        if self.worker.is_some() {
            return Err(RigError::Audio("stream already running".into()));
        }
        let period = buffer_period(buffer.len(), sample_rate);
        // Poll the flag at a fraction of the buffer period so cancellation lands
        // within one callback.
        let tick = (period / 4).clamp(Duration::from_micros(500), Duration::from_millis(5));
        self.worker = Some(std::thread::spawn(move || {
            let mut callbacks = 0u64;
            let mut in_buffer = Duration::ZERO;
            while !cancel.is_cancelled() {
                std::thread::sleep(tick);
                in_buffer += tick;
                if in_buffer >= period {
                    in_buffer = Duration::ZERO;
                    callbacks += 1;
                }
            }
            callbacks
        }));
        Ok(())
    }

    fn finish_stream(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            let callbacks = worker
                .join()
                .map_err(|_| RigError::ThreadPanicked("audio stream"))?;
            debug!(callbacks, "audio stream stopped");
        }
        Ok(())
    }

    fn play_blocking(&mut self, samples: &[i16], sample_rate: u32) -> Result<()> {
        std::thread::sleep(buffer_period(samples.len(), sample_rate));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    StreamStarted { samples: usize, sample_rate: u32 },
    StreamFinished { cancelled: bool },
    Blocking { samples: usize },
}

/// Records what would have been played. Never sleeps; for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct RecordingAudio {
    events: Arc<Mutex<Vec<AudioEvent>>>,
    cancel: Option<CancelAudio>,
}

impl RecordingAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AudioEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: AudioEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| RigError::Audio("event log poisoned".into()))?
            .push(event);
        Ok(())
    }
}

impl AudioOutput for RecordingAudio {
    fn start_stream(&mut self, buffer: Arc<[i16]>, sample_rate: u32, cancel: CancelAudio) -> Result<()> {
        self.cancel = Some(cancel);
        self.push(AudioEvent::StreamStarted {
            samples: buffer.len(),
            sample_rate,
        })
    }

    fn finish_stream(&mut self) -> Result<()> {
        let cancelled = self.cancel.take().is_some_and(|c| c.is_cancelled());
        self.push(AudioEvent::StreamFinished { cancelled })
    }

    fn play_blocking(&mut self, samples: &[i16], _sample_rate: u32) -> Result<()> {
        self.push(AudioEvent::Blocking {
            samples: samples.len(),
        })
    }
}

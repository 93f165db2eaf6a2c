//! # wheelrig
//!
//! Closed-loop control for a head-fixed auditory wheel-turning task.
//!
//! A trial waits for the wheel to stay still, streams a tone cloud, watches the
//! rotary encoder against a turning threshold, resolves the animal's choice
//! under a deadline, rewards or punishes, and sleeps through an inter-trial
//! interval. Between trials the curriculum picks the next stimulus class
//! (shaping, debiasing, block structure); at the end of a session it decides
//! whether the animal advances to the next training stage.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use wheelrig::prelude::*;
//!
//! # fn demo(ctx: SessionContext, hardware: RigHardware) -> wheelrig::error::Result<()> {
//! let boot = SessionBootstrap::from_history(&ctx);
//! let dir = ctx.store.create_session(chrono::Local::now())?;
//! let mut session = Session::start(ctx, boot, dir, hardware, None)?;
//!
//! let stop = AtomicBool::new(false);
//! let ending = session.run(&stop)?;
//! let meta = session.finish(&GridFit::default(), chrono::Local::now())?;
//! println!("{ending:?} stage {} advance {}", meta.curr_stage, meta.stage_advance);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`trial`]: the per-trial state machine
//! - [`curriculum`]: stimulus selection, reward adaptation, session-continuation
//! - [`stage`]: stage-advance criteria over current and past sessions
//! - [`session`]: bootstrap from history, trial loop, metadata at stop
//! - [`recorder`]: fixed-rate position / sync / camera loops

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/clock.rs"]
pub mod clock;

#[path = "core/position.rs"]
pub mod position;

#[path = "core/policy.rs"]
pub mod policy;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/stimulus.rs"]
pub mod stimulus;

#[path = "core/audio.rs"]
pub mod audio;

#[path = "core/reward.rs"]
pub mod reward;

#[path = "core/event_log.rs"]
pub mod event_log;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/curriculum.rs"]
pub mod curriculum;

#[path = "core/stage.rs"]
pub mod stage;

#[path = "core/psychometric.rs"]
pub mod psychometric;

#[path = "core/trial.rs"]
pub mod trial;

#[path = "core/session.rs"]
pub mod session;

#[path = "core/recorder.rs"]
pub mod recorder;

/// Prelude module for convenient imports.
///
/// ```
/// use wheelrig::prelude::*;
/// ```
pub mod prelude {
    pub use crate::audio::{AudioOutput, CancelAudio, RecordingAudio, SilentAudio};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ResponseMatrix, RigSettings, TaskPrefs};
    pub use crate::curriculum::{BlockState, Curriculum, SessionLimits, TrialPlan};
    pub use crate::error::{Result, RigError};
    pub use crate::policy::{Choice, Decision, StimulusClass, TaskKind, TrialOutcome, WheelSide};
    pub use crate::position::{PositionSource, ScriptedPosition, SharedEncoder};
    pub use crate::psychometric::GridFit;
    pub use crate::reward::{OutputPin, RewardActuator};
    pub use crate::session::{RigHardware, Session, SessionBootstrap, SessionContext};
    pub use crate::stage::{PsychometricFit, PsychometricParams, StageEvaluator};
    pub use crate::storage::{AnimalStore, EndingCriteria, RigLayout, SessionMetadata};
    pub use crate::trial::{TrialMachine, TrialResult, TrialState};
}

//! One training session: bootstrap from history, the trial loop, and the
//! metadata written at stop.
//!
//! Responsibilities:
//! - load every configuration document once into a [`SessionContext`]
//! - derive stage, bias-correction side and pump duration from past sessions
//! - run trials until the operator stops or a continuation check fires
//! - evaluate stage advancement and persist the session's metadata

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::audio::AudioOutput;
use crate::clock::Clock;
use crate::config::{load_pump_calibration, ResponseMatrix, ResponseMatrixFile, RigSettings, TaskPrefs};
use crate::curriculum::{bias_correction_side, Curriculum, SessionLimits};
use crate::error::Result;
use crate::event_log::{CsvLog, SessionSummary, ToneCloudLog, TrialEventLog};
use crate::policy::{TaskKind, WheelSide};
use crate::position::PositionSource;
use crate::prng::TaskRng;
use crate::reward::{adapt_pump_duration, read_pump_log, OutputPin, PumpBounds, RewardActuator};
use crate::stage::{PsychometricFit, StageEvaluator};
use crate::stimulus::StimulusGenerator;
use crate::storage::{AnimalStore, EndingCriteria, RigLayout, SessionDir, SessionMetadata};
use crate::trial::{SessionLogs, TrialMachine, TrialResult, TrialRig, TrialTiming};

// ═══════════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════════

/// Everything loaded once before the first trial. Configuration problems are
/// fatal here; nothing downstream reads files for settings.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub layout: RigLayout,
    pub store: AnimalStore,
    pub task: TaskKind,
    pub experimenter: String,
    pub droid: String,
    pub settings: RigSettings,
    pub prefs: TaskPrefs,
    pub matrix: ResponseMatrix,
    pub ms_per_ul: f64,
}

impl SessionContext {
    pub fn load(layout: RigLayout, animal: &str, task: TaskKind, experimenter: &str, droid: &str) -> Result<Self> {
        let settings = RigSettings::load(&layout.rig_settings_path())?;
        let prefs = TaskPrefs::load(&layout.task_prefs_path(task))?;
        let matrix = match task {
            TaskKind::Detection => ResponseMatrix::detection(),
            TaskKind::TwoAfc | TaskKind::GoNoGo => {
                ResponseMatrixFile::load(&layout.response_matrix_path(animal))?
                    .active()
                    .clone()
            }
        };
        matrix.validate_for(task)?;
        let ms_per_ul = load_pump_calibration(&layout.calibration_dir())?;
        let store = AnimalStore::open(&layout, animal)?;
        Ok(Self {
            layout,
            store,
            task,
            experimenter: experimenter.to_string(),
            droid: droid.to_string(),
            settings,
            prefs,
            matrix,
            ms_per_ul,
        })
    }

    pub fn animal(&self) -> &str {
        self.store.animal()
    }

    pub fn pump_bounds(&self) -> PumpBounds {
        PumpBounds::from_reward_size(self.prefs.task_prefs.reward_size, self.ms_per_ul)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Bootstrap
// ═══════════════════════════════════════════════════════════════════════════

/// Per-session state seeded from earlier sessions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionBootstrap {
    pub first_day: bool,
    pub stage: u8,
    pub bias_correction: Option<WheelSide>,
    pub pump_duration_ms: f64,
}

impl SessionBootstrap {
    /// Read before the new session directory exists.
    ///
    /// The stage continues from the latest metadata of the same procedure
    /// (`curr_stage`, plus one if it advanced); anything else starts at 0.
    pub fn from_history(ctx: &SessionContext) -> Self {
        let task = ctx.task;
        let first_day = ctx.store.is_first_day();
        let previous = ctx.store.latest_metadata(None);
        let stage = match &previous {
            Some(meta) if meta.procedure == task.procedure() => meta.next_stage().min(task.max_stage()),
            Some(meta) => {
                info!("previous procedure was {}, starting {task} at stage 0", meta.procedure);
                0
            }
            None => 0,
        };

        let bias_correction = if first_day || stage <= 1 || task != TaskKind::TwoAfc {
            None
        } else {
            let last = ctx.store.recent_sessions(1, None);
            let trials: Vec<_> = last.iter().flat_map(|s| s.read_trials()).collect();
            bias_correction_side(&trials)
        };

        let bounds = ctx.pump_bounds();
        let pump_duration_ms = if first_day || stage == 0 {
            bounds.max_ms
        } else {
            let previous: Vec<f64> = ctx
                .store
                .last_day_sessions(None)
                .iter()
                .flat_map(|s| s.read_pump_durations())
                .collect();
            adapt_pump_duration(&previous, ctx.ms_per_ul, bounds).unwrap_or_else(|| {
                warn!("no pump data from the last session, using the maximum reward");
                bounds.max_ms
            })
        };

        info!(
            first_day,
            stage,
            ?bias_correction,
            pump_duration_ms,
            "session bootstrap"
        );
        Self {
            first_day,
            stage,
            bias_correction,
            pump_duration_ms,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════

/// Hardware handles handed to a session.
pub struct RigHardware {
    pub position: Arc<dyn PositionSource>,
    pub clock: Arc<dyn Clock>,
    pub audio: Box<dyn AudioOutput>,
    pub pump_pin: Box<dyn OutputPin>,
}

pub struct Session {
    ctx: SessionContext,
    boot: SessionBootstrap,
    dir: SessionDir,
    machine: TrialMachine,
    curriculum: Curriculum,
    evaluator: StageEvaluator,
    clock: Arc<dyn Clock>,
    started: Duration,
    start_time: DateTime<Local>,
    ending: EndingCriteria,
    sync_record: bool,
    camera_data: bool,
}

fn local_time(unix_secs: f64) -> DateTime<Local> {
    DateTime::from_timestamp_micros((unix_secs * 1e6) as i64)
        .map(|t| t.with_timezone(&Local))
        .unwrap_or_else(Local::now)
}

impl Session {
    /// Open the session's logs and wire the trial machine. `seed` makes every
    /// stochastic choice reproducible.
    pub fn start(
        ctx: SessionContext,
        boot: SessionBootstrap,
        dir: SessionDir,
        hardware: RigHardware,
        seed: Option<u64>,
    ) -> Result<Self> {
        let mut rng = seed.map(TaskRng::new).unwrap_or_else(TaskRng::from_entropy);
        let stimulus = Arc::new(StimulusGenerator::new(&ctx.settings, &ctx.prefs));
        let timing = TrialTiming::from_prefs(&ctx.prefs, boot.stage, stimulus.cloud_duration());

        let reward = RewardActuator::new(
            hardware.pump_pin,
            ctx.ms_per_ul,
            boot.pump_duration_ms,
            Some(CsvLog::create(&dir.pump_log_path())?),
        );
        let rig = TrialRig {
            position: hardware.position,
            clock: Arc::clone(&hardware.clock),
            audio: hardware.audio,
            reward,
        };
        let logs = SessionLogs {
            trials: TrialEventLog::create(&dir.trial_log_path())?,
            tone_clouds: Some(ToneCloudLog::create(&dir.tone_cloud_log_path())?),
        };
        let machine = TrialMachine::new(ctx.task, timing, stimulus, rig, logs, rng.fork());
        let curriculum = Curriculum::new(
            ctx.task,
            boot.stage,
            ctx.matrix.clone(),
            &ctx.prefs,
            boot.bias_correction,
            rng.fork(),
        );

        let clock = hardware.clock;
        info!(
            animal = ctx.animal(),
            task = %ctx.task,
            stage = boot.stage,
            dir = %dir.path().display(),
            "session started"
        );
        Ok(Self {
            started: clock.now(),
            start_time: local_time(clock.wall_secs()),
            ctx,
            boot,
            dir,
            machine,
            curriculum,
            evaluator: StageEvaluator::default(),
            clock,
            ending: EndingCriteria::Manual,
            sync_record: false,
            camera_data: false,
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn bootstrap(&self) -> &SessionBootstrap {
        &self.boot
    }

    pub fn dir(&self) -> &SessionDir {
        &self.dir
    }

    pub fn curriculum(&self) -> &Curriculum {
        &self.curriculum
    }

    pub fn set_limits(&mut self, limits: SessionLimits) {
        self.curriculum.set_limits(limits);
    }

    pub fn set_evaluator(&mut self, evaluator: StageEvaluator) {
        self.evaluator = evaluator;
    }

    /// Flags copied into the metadata.
    pub fn mark_recorders(&mut self, sync_record: bool, camera_data: bool) {
        self.sync_record = sync_record;
        self.camera_data = camera_data;
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started)
    }

    pub fn run_trial(&mut self) -> Result<TrialResult> {
        let plan = self.curriculum.plan_trial()?;
        let result = self.machine.run(plan, &mut self.curriculum)?;
        info!(
            "trial number: {} - correct trials: {}",
            result.trial_num,
            self.curriculum.counts().correct
        );
        Ok(result)
    }

    /// Run trials until `stop` is raised (checked between trials) or a
    /// continuation check ends the session.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<EndingCriteria> {
        loop {
            if stop.load(Ordering::SeqCst) {
                self.ending = EndingCriteria::Manual;
                break;
            }
            self.run_trial()?;
            if let Some(ending) = self.curriculum.continuation(self.elapsed()) {
                self.ending = ending;
                break;
            }
        }
        info!(ending = ?self.ending, trials = self.curriculum.trials(), "session loop ended");
        Ok(self.ending)
    }

    pub fn ending(&self) -> EndingCriteria {
        self.ending
    }

    /// Evaluate stage advancement against the prior sessions and write the
    /// metadata and preference snapshot into the session directory.
    pub fn finish(&self, fitter: &dyn PsychometricFit, end_time: DateTime<Local>) -> Result<SessionMetadata> {
        let tally = self.curriculum.tally();
        let history: Vec<_> = self
            .ctx
            .store
            .recent_sessions(self.evaluator.criteria.history_sessions, Some(self.dir.path()))
            .iter()
            .filter_map(|s| self.ctx.store.load_history(s))
            .collect();
        let decision = self.evaluator.evaluate(&tally, &history, &self.ctx.matrix, fitter)?;

        let meta = SessionMetadata {
            animal_id: self.ctx.animal().to_string(),
            droid: self.ctx.droid.clone(),
            experimenter: self.ctx.experimenter.clone(),
            procedure: self.ctx.task.procedure().to_string(),
            date: self.start_time.format("%Y-%m-%d").to_string(),
            start: self.start_time.format("%H:%M:%S").to_string(),
            end: end_time.format("%H:%M:%S").to_string(),
            sync_record: self.sync_record,
            camera_data: self.camera_data,
            trials: tally.trials,
            trial_statistics: tally.counts,
            pump_duration: self.machine.reward().duration_ms(),
            iti_range: self.ctx.prefs.task_prefs.inter_trial_interval,
            bias_correction: self.boot.bias_correction,
            pre_reversal: true,
            ending_criteria: self.ending,
            curr_stage: tally.stage,
            stage_advance: decision.advance,
            ready_for_experiment: decision.ready_for_experiment,
        };
        let path = self.dir.write_metadata(&meta)?;
        self.dir.write_prefs_snapshot(&self.ctx.layout, self.ctx.task)?;
        info!("metadata written to {}", path.display());
        Ok(meta)
    }

    /// Outcome, trial-type, decision and volume totals read back from the logs.
    pub fn summary(&self) -> SessionSummary {
        let pumps = read_pump_log(&self.dir.pump_log_path()).unwrap_or_default();
        SessionSummary::from_logs(&self.dir.read_trials(), &pumps, self.ctx.ms_per_ul)
    }
}

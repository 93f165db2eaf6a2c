//! One trial, from the quiet-window gate to the end of the inter-trial interval.
//!
//! ```text
//! QuietWait ──▶ StimulusArmed ──▶ DecisionWait ──▶ Resolved ──▶ Iti ──▶ Done
//!     ▲  │
//!     └──┘ excursion outside the jitter band restarts the quiet timer
//! ```
//!
//! [`TrialMachine::advance`] is the only place a state changes. Each call does
//! one bounded step (one poll, one sleep or one action) and returns the next
//! state, so every wait goes through the injected [`Clock`].

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::audio::{AudioOutput, CancelAudio};
use crate::clock::Clock;
use crate::config::TaskPrefs;
use crate::curriculum::{Curriculum, TrialPlan};
use crate::error::{Result, RigError};
use crate::event_log::{Phase, ToneCloudLog, TrialEventLog, TrialRecord};
use crate::policy::{Decision, ItiTable, StimulusClass, TaskKind, TrialOutcome, WheelSide};
use crate::position::PositionSource;
use crate::prng::TaskRng;
use crate::reward::RewardActuator;
use crate::stimulus::{StimulusGenerator, ToneCloud};

/// Polling period of the quiet and decision loops.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);
pub const MAX_QUIET_WINDOW: Duration = Duration::from_millis(1500);
/// Stream time before tone onset, in cloud durations.
pub const PRIMING_CLOUDS: u32 = 2;

/// `base + Exp(scale)` seconds, capped at [`MAX_QUIET_WINDOW`].
pub fn quiet_window_duration(base: f64, scale: f64, rng: &mut TaskRng) -> Duration {
    let secs = (base + rng.exponential(scale)).max(0.0);
    Duration::from_secs_f64(secs).min(MAX_QUIET_WINDOW)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietStatus {
    Waiting,
    Restarted,
    Satisfied,
}

/// Requires the wheel to stay within `jitter` ticks of a baseline for a
/// contiguous `window`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietGate {
    baseline: i64,
    jitter: i64,
    window: Duration,
    since: Duration,
}

impl QuietGate {
    pub fn new(baseline: i64, jitter: i64, window: Duration, now: Duration) -> Self {
        Self {
            baseline,
            jitter,
            window,
            since: now,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    pub fn poll(&mut self, position: i64, now: Duration) -> QuietStatus {
        if (position - self.baseline).abs() > self.jitter {
            self.baseline = position;
            self.since = now;
            return QuietStatus::Restarted;
        }
        if now.saturating_sub(self.since) >= self.window {
            QuietStatus::Satisfied
        } else {
            QuietStatus::Waiting
        }
    }
}

/// Per-stage timing and thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialTiming {
    /// Turning goal, encoder ticks.
    pub goal: i64,
    /// Quiet-window jitter band, encoder ticks.
    pub jitter: i64,
    pub quiet_base: f64,
    pub quiet_scale: f64,
    pub response_window: Duration,
    pub priming: Duration,
    pub iti: ItiTable,
}

impl TrialTiming {
    pub fn from_prefs(prefs: &TaskPrefs, stage: u8, cloud_duration: Duration) -> Self {
        let t = &prefs.task_prefs;
        Self {
            goal: prefs.turning_goal(stage),
            jitter: prefs.quiet_jitter_ticks(),
            quiet_base: t.quiet_window[0],
            quiet_scale: t.quiet_window[1],
            response_window: Duration::from_secs_f64(t.response_window),
            priming: cloud_duration * PRIMING_CLOUDS,
            iti: prefs.iti(),
        }
    }
}

/// Hardware the trial loop drives.
pub struct TrialRig {
    pub position: Arc<dyn PositionSource>,
    pub clock: Arc<dyn Clock>,
    pub audio: Box<dyn AudioOutput>,
    pub reward: RewardActuator,
}

pub struct SessionLogs {
    pub trials: TrialEventLog,
    pub tone_clouds: Option<ToneCloudLog>,
}

/// What a finished trial hands back to the curriculum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialResult {
    pub trial_num: u32,
    pub class: StimulusClass,
    pub strength: u8,
    pub decision: Decision,
    pub side: Option<WheelSide>,
    pub outcome: TrialOutcome,
    /// Seconds from tone onset to resolution.
    pub reaction_time: f64,
    pub rewarded: bool,
    pub reward_ms: u64,
    pub iti: f64,
    pub block: i8,
}

#[derive(Debug)]
pub enum TrialState {
    QuietWait(QuietGate),
    StimulusArmed,
    DecisionWait {
        reference: i64,
        onset: Duration,
        deadline: Duration,
    },
    Resolved(TrialResult),
    Iti(TrialResult),
    Done(TrialResult),
}

/// Per-trial scratch owned by one [`TrialMachine::run`] call.
pub struct TrialRun {
    pub plan: TrialPlan,
    cloud: Option<JoinHandle<Result<ToneCloud>>>,
    cancel: CancelAudio,
    streaming: bool,
}

pub struct TrialMachine {
    task: TaskKind,
    timing: TrialTiming,
    stimulus: Arc<StimulusGenerator>,
    rig: TrialRig,
    logs: SessionLogs,
    rng: TaskRng,
    punishment: Vec<i16>,
    /// Wall time at `mono_anchor`; row timestamps advance with the monotonic clock.
    wall_anchor: f64,
    mono_anchor: Duration,
}

impl TrialMachine {
    pub fn new(
        task: TaskKind,
        timing: TrialTiming,
        stimulus: Arc<StimulusGenerator>,
        rig: TrialRig,
        logs: SessionLogs,
        mut rng: TaskRng,
    ) -> Self {
        let punishment = stimulus.punishment(&mut rng);
        let wall_anchor = rig.clock.wall_secs();
        let mono_anchor = rig.clock.now();
        Self {
            task,
            timing,
            stimulus,
            rig,
            logs,
            rng,
            punishment,
            wall_anchor,
            mono_anchor,
        }
    }

    pub fn timing(&self) -> &TrialTiming {
        &self.timing
    }

    pub fn rig(&self) -> &TrialRig {
        &self.rig
    }

    pub fn reward(&self) -> &RewardActuator {
        &self.rig.reward
    }

    fn row(&self, plan: &TrialPlan, phase: Phase) -> TrialRecord {
        TrialRecord {
            time: self.wall_anchor + self.rig.clock.now().saturating_sub(self.mono_anchor).as_secs_f64(),
            trial_num: plan.trial_num,
            phase,
            trial_type: plan.class,
            stim_strength: plan.strength,
            decision: None,
            choice: None,
            left_right: None,
            reward: false,
            inter_trial_interval: None,
            block: plan.block,
        }
    }

    /// Run one trial to completion and report it to the curriculum.
    pub fn run(&mut self, plan: TrialPlan, curriculum: &mut Curriculum) -> Result<TrialResult> {
        let start = self.row(&plan, Phase::TrialStart);
        self.logs.trials.append(&start)?;

        let generator = Arc::clone(&self.stimulus);
        let mut cloud_rng = self.rng.fork();
        let cloud = std::thread::Builder::new()
            .name("tone-cloud".into())
            .spawn(move || generator.tone_cloud(plan.class, plan.strength, &mut cloud_rng))?;

        let mut run = TrialRun {
            plan,
            cloud: Some(cloud),
            cancel: CancelAudio::new(),
            streaming: false,
        };
        let window = quiet_window_duration(self.timing.quiet_base, self.timing.quiet_scale, &mut self.rng);
        let gate = QuietGate::new(
            self.rig.position.position(),
            self.timing.jitter,
            window,
            self.rig.clock.now(),
        );
        debug!(trial = plan.trial_num, class = %plan.class, strength = plan.strength, ?window, "trial start");

        let mut state = TrialState::QuietWait(gate);
        loop {
            match self.advance(state, &mut run, curriculum) {
                Ok(TrialState::Done(result)) => {
                    curriculum.record(&result);
                    return Ok(result);
                }
                Ok(next) => state = next,
                Err(e) => {
                    self.abort_stream(&mut run);
                    return Err(e);
                }
            }
        }
    }

    /// Silence a stream left running by a failed step.
    fn abort_stream(&mut self, run: &mut TrialRun) {
        run.cancel.cancel();
        if run.streaming {
            run.streaming = false;
            if let Err(e) = self.rig.audio.finish_stream() {
                warn!("audio stream did not stop cleanly: {e}");
            }
        }
    }

    /// The transition function.
    ///
    /// The response deadline and the reaction time both count from tone
    /// onset, i.e. after the priming clouds, not from the end of the quiet
    /// window.
    pub fn advance(
        &mut self,
        state: TrialState,
        run: &mut TrialRun,
        curriculum: &mut Curriculum,
    ) -> Result<TrialState> {
        let clock = Arc::clone(&self.rig.clock);
        match state {
            TrialState::QuietWait(mut gate) => {
                match gate.poll(self.rig.position.position(), clock.now()) {
                    QuietStatus::Satisfied => {
                        let cloud = self.take_cloud(run)?;
                        if let Some(log) = self.logs.tone_clouds.as_mut() {
                            log.append(&cloud.frequencies)?;
                        }
                        run.cancel.reset();
                        self.rig
                            .audio
                            .start_stream(cloud.samples, self.stimulus.sample_rate(), run.cancel.clone())?;
                        run.streaming = true;
                        Ok(TrialState::StimulusArmed)
                    }
                    QuietStatus::Restarted => {
                        debug!(baseline = gate.baseline(), "quiet window restarted");
                        clock.sleep(POLL_INTERVAL);
                        Ok(TrialState::QuietWait(gate))
                    }
                    QuietStatus::Waiting => {
                        clock.sleep(POLL_INTERVAL);
                        Ok(TrialState::QuietWait(gate))
                    }
                }
            }

            TrialState::StimulusArmed => {
                clock.sleep(self.timing.priming);
                let onset = clock.now();
                let reference = self.rig.position.position();
                let row = self.row(&run.plan, Phase::ToneOnset);
                self.logs.trials.append(&row)?;
                Ok(TrialState::DecisionWait {
                    reference,
                    onset,
                    deadline: onset + self.timing.response_window,
                })
            }

            TrialState::DecisionWait {
                reference,
                onset,
                deadline,
            } => {
                let now = clock.now();
                let delta = self.rig.position.position() - reference;
                let (mut decision, side) = self.task.classify_wheel(delta, self.timing.goal);
                let expired = now >= deadline;
                if expired && !decision.is_committed() {
                    decision = self.task.on_deadline();
                }
                let Some(outcome) = self.task.resolve(decision, run.plan.required, expired) else {
                    clock.sleep(POLL_INTERVAL);
                    return Ok(TrialState::DecisionWait {
                        reference,
                        onset,
                        deadline,
                    });
                };

                run.cancel.cancel();
                run.streaming = false;
                self.rig.audio.finish_stream()?;
                Ok(TrialState::Resolved(TrialResult {
                    trial_num: run.plan.trial_num,
                    class: run.plan.class,
                    strength: run.plan.strength,
                    decision,
                    side,
                    outcome,
                    reaction_time: now.saturating_sub(onset).as_secs_f64(),
                    rewarded: self.task.rewards(outcome, decision),
                    reward_ms: 0,
                    iti: self.task.iti_for(outcome, self.timing.iti),
                    block: run.plan.block,
                }))
            }

            TrialState::Resolved(mut result) => {
                let mut row = self.row(&run.plan, Phase::Outcome);
                row.decision = Some(result.decision);
                row.choice = Some(result.outcome.choice());
                row.left_right = result.side;
                row.reward = result.rewarded;
                row.inter_trial_interval = Some(result.iti);
                self.logs.trials.append(&row)?;

                if result.rewarded {
                    let multiplier = curriculum.reward_multiplier(result.decision);
                    result.reward_ms = self.rig.reward.dispense(&clock, multiplier)?;
                }
                if self.task.punishes(result.outcome, run.plan.required) {
                    self.rig
                        .audio
                        .play_blocking(&self.punishment, self.stimulus.sample_rate())?;
                }
                debug!(
                    trial = result.trial_num,
                    decision = %result.decision,
                    outcome = ?result.outcome,
                    rt = result.reaction_time,
                    "trial resolved"
                );
                Ok(TrialState::Iti(result))
            }

            TrialState::Iti(result) => {
                clock.sleep(Duration::from_secs_f64(result.iti.max(0.0)));
                let mut row = self.row(&run.plan, Phase::ItiComplete);
                row.inter_trial_interval = Some(result.iti);
                self.logs.trials.append(&row)?;
                Ok(TrialState::Done(result))
            }

            TrialState::Done(result) => Ok(TrialState::Done(result)),
        }
    }

    fn take_cloud(&self, run: &mut TrialRun) -> Result<ToneCloud> {
        let handle = run
            .cloud
            .take()
            .ok_or_else(|| RigError::Stimulus("tone cloud already consumed".into()))?;
        handle
            .join()
            .map_err(|_| RigError::ThreadPanicked("tone cloud"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioEvent, RecordingAudio};
    use crate::clock::ManualClock;
    use crate::config::tests::{sample_prefs, sample_settings};
    use crate::config::ResponseMatrix;
    use crate::curriculum::tests::matrix_high_left;
    use crate::curriculum::SelectionReason;
    use crate::event_log::{read_trial_log, CsvLog};
    use crate::position::ScriptedPosition;
    use crate::reward::tests::TracePin;
    use crate::reward::read_pump_log;
    use proptest::prelude::*;

    struct Bench {
        machine: TrialMachine,
        curriculum: Curriculum,
        clock: ManualClock,
        audio: RecordingAudio,
        pin: TracePin,
        dir: tempfile::TempDir,
    }

    fn bench(
        task: TaskKind,
        matrix: ResponseMatrix,
        bias: Option<WheelSide>,
        script: impl FnOnce(ScriptedPosition<ManualClock>) -> ScriptedPosition<ManualClock>,
    ) -> Bench {
        bench_with(sample_prefs(), |c| Arc::new(c) as Arc<dyn Clock>, task, matrix, bias, script)
    }

    fn bench_with(
        prefs: TaskPrefs,
        rig_clock: impl FnOnce(ManualClock) -> Arc<dyn Clock>,
        task: TaskKind,
        matrix: ResponseMatrix,
        bias: Option<WheelSide>,
        script: impl FnOnce(ScriptedPosition<ManualClock>) -> ScriptedPosition<ManualClock>,
    ) -> Bench {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::with_epoch(0.0);
        let stimulus = Arc::new(StimulusGenerator::new(&sample_settings(), &prefs));
        let mut timing = TrialTiming::from_prefs(&prefs, 1, stimulus.cloud_duration());
        timing.quiet_scale = 0.0;

        let audio = RecordingAudio::new();
        let pin = TracePin::default();
        let pump_log = CsvLog::create(&dir.path().join("pump.csv")).unwrap();
        let rig = TrialRig {
            position: Arc::new(script(ScriptedPosition::new(clock.clone(), 0))),
            clock: rig_clock(clock.clone()),
            audio: Box::new(audio.clone()),
            reward: RewardActuator::new(Box::new(pin.clone()), 50.0, 100.0, Some(pump_log)),
        };
        let logs = SessionLogs {
            trials: TrialEventLog::create(&dir.path().join("trials.csv")).unwrap(),
            tone_clouds: Some(ToneCloudLog::create(&dir.path().join("clouds.csv")).unwrap()),
        };
        let machine = TrialMachine::new(task, timing, stimulus, rig, logs, TaskRng::new(3));
        let curriculum = Curriculum::new(task, 1, matrix, &prefs, bias, TaskRng::new(4));
        Bench {
            machine,
            curriculum,
            clock,
            audio,
            pin,
            dir,
        }
    }

    fn plan(class: StimulusClass, required: Decision) -> TrialPlan {
        TrialPlan {
            trial_num: 1,
            class,
            strength: 100,
            required,
            block: 0,
            reason: SelectionReason::Uniform,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // quiet window 0.2 s + priming 0.25 s: tone onset at 0.45 s
    const ONSET: u64 = 450;

    #[test]
    fn right_turn_on_right_trial_is_rewarded() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| p.then(ms(600), 100));
        let r = b
            .machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.decision, Decision::Right);
        assert_eq!(r.outcome, TrialOutcome::Correct);
        assert!((r.reaction_time - 0.15).abs() < 1e-9);
        assert_eq!(r.reward_ms, 100);
        assert_eq!(r.iti, 1.0);
        assert_eq!(*b.pin.0.lock().unwrap(), vec![true, false]);

        let rows = read_trial_log(&b.dir.path().join("trials.csv")).unwrap();
        let phases: Vec<_> = rows.iter().map(|r| r.phase).collect();
        assert_eq!(
            phases,
            vec![Phase::TrialStart, Phase::ToneOnset, Phase::Outcome, Phase::ItiComplete]
        );
        assert!((rows[1].time - 0.45).abs() < 1e-9);
        assert!(rows[2].reward);
        assert_eq!(
            b.audio.events(),
            vec![
                AudioEvent::StreamStarted {
                    samples: 1000,
                    sample_rate: 8000
                },
                AudioEvent::StreamFinished { cancelled: true },
            ]
        );
        assert_eq!(b.curriculum.trials(), 1);
        assert_eq!(b.curriculum.decision_history(), &[1]);
        assert_eq!(b.curriculum.correct_history(), &[true]);
        // pump hold 0.1 s + ITI 1 s after resolution at 0.6 s
        assert_eq!(b.clock.now(), ms(1700));
    }

    /// Host clock stepped back 2 s once the trial is underway.
    struct SteppedBackClock(ManualClock);

    impl Clock for SteppedBackClock {
        fn now(&self) -> Duration {
            self.0.now()
        }

        fn sleep(&self, d: Duration) {
            self.0.sleep(d)
        }

        fn wall_secs(&self) -> f64 {
            let wall = self.0.wall_secs();
            if self.0.now() > ms(500) {
                wall - 2.0
            } else {
                wall
            }
        }
    }

    #[test]
    fn wall_clock_step_back_keeps_rows_ordered() {
        let mut b = bench_with(
            sample_prefs(),
            |c| Arc::new(SteppedBackClock(c)) as Arc<dyn Clock>,
            TaskKind::TwoAfc,
            matrix_high_left(),
            None,
            |p| p.then(ms(600), 100),
        );
        let r = b
            .machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.outcome, TrialOutcome::Correct);
        assert_eq!(b.curriculum.trials(), 1);

        let rows = read_trial_log(&b.dir.path().join("trials.csv")).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.windows(2).all(|w| w[0].time <= w[1].time));
        assert!((rows[2].time - 0.6).abs() < 1e-9);
    }

    /// Audio sink whose stream never winds down cleanly.
    #[derive(Clone, Default)]
    struct StuckAudio {
        inner: RecordingAudio,
        cancel: Arc<std::sync::Mutex<Option<CancelAudio>>>,
    }

    impl AudioOutput for StuckAudio {
        fn start_stream(&mut self, buffer: Arc<[i16]>, sample_rate: u32, cancel: CancelAudio) -> Result<()> {
            *self.cancel.lock().unwrap() = Some(cancel.clone());
            self.inner.start_stream(buffer, sample_rate, cancel)
        }

        fn finish_stream(&mut self) -> Result<()> {
            Err(RigError::Audio("device stalled".into()))
        }

        fn play_blocking(&mut self, samples: &[i16], sample_rate: u32) -> Result<()> {
            self.inner.play_blocking(samples, sample_rate)
        }
    }

    #[test]
    fn failed_stream_stop_leaves_stream_cancelled() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| p.then(ms(600), 100));
        let stuck = StuckAudio::default();
        b.machine.rig.audio = Box::new(stuck.clone());
        let err = b
            .machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap_err();
        assert!(matches!(err, RigError::Audio(_)));
        assert!(stuck.cancel.lock().unwrap().as_ref().is_some_and(|c| c.is_cancelled()));
        assert_eq!(b.curriculum.trials(), 0);
    }

    #[test]
    fn tone_cloud_failure_aborts_before_playback() {
        let mut prefs = sample_prefs();
        prefs.task_prefs.cloud_duration = 0.01;
        let mut b = bench_with(
            prefs,
            |c| Arc::new(c) as Arc<dyn Clock>,
            TaskKind::TwoAfc,
            matrix_high_left(),
            None,
            |p| p,
        );
        let err = b
            .machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap_err();
        assert!(matches!(err, RigError::Stimulus(_)), "{err}");

        let rows = read_trial_log(&b.dir.path().join("trials.csv")).unwrap();
        let phases: Vec<_> = rows.iter().map(|r| r.phase).collect();
        assert_eq!(phases, vec![Phase::TrialStart]);
        assert_eq!(b.curriculum.trials(), 0);
        assert!(b.audio.events().is_empty());
        assert!(b.pin.0.lock().unwrap().is_empty());
    }

    #[test]
    fn incorrect_turn_is_punished_with_double_penalty_iti() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| p.then(ms(500), -100));
        let r = b
            .machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.decision, Decision::Left);
        assert_eq!(r.outcome, TrialOutcome::Incorrect);
        assert_eq!(r.iti, 6.0);
        assert!(!r.rewarded);
        assert!(b.pin.0.lock().unwrap().is_empty());
        assert_eq!(b.audio.events().last(), Some(&AudioEvent::Blocking { samples: 4000 }));
    }

    #[test]
    fn no_movement_is_an_omission_at_the_deadline() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| p.then(ms(1000), 50));
        let r = b
            .machine
            .run(plan(StimulusClass::High, Decision::Left), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.decision, Decision::Undecided);
        assert_eq!(r.outcome, TrialOutcome::Omission);
        assert_eq!(r.iti, 3.0);
        assert!((r.reaction_time - 10.0).abs() < 1e-9);
        assert_eq!(b.curriculum.decision_history(), &[0]);
        assert_eq!(b.curriculum.counts().omission, 1);
        // resolution at onset + 10 s, then the 3 s ITI
        assert_eq!(b.clock.now(), ms(ONSET + 10_000 + 3_000));
    }

    #[test]
    fn exactly_the_goal_is_not_a_choice() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| p.then(ms(600), 85));
        let r = b
            .machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.outcome, TrialOutcome::Omission);
    }

    #[test]
    fn quiet_window_restarts_on_excursion() {
        // leaves the 6-tick band at 0.1 s, then drifts inside the new band
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| {
            p.then(ms(100), 20).then(ms(250), 24).then(ms(900), 200)
        });
        b.machine
            .run(plan(StimulusClass::Low, Decision::Right), &mut b.curriculum)
            .unwrap();
        let rows = read_trial_log(&b.dir.path().join("trials.csv")).unwrap();
        // contiguous stillness from 0.1 s to 0.3 s, then 0.25 s priming
        assert!((rows[1].time - 0.55).abs() < 1e-9, "onset at {}", rows[1].time);
    }

    #[test]
    fn quiet_gate_needs_contiguous_window() {
        let mut gate = QuietGate::new(0, 6, ms(200), Duration::ZERO);
        assert_eq!(gate.poll(6, ms(150)), QuietStatus::Waiting);
        assert_eq!(gate.poll(7, ms(199)), QuietStatus::Restarted);
        assert_eq!(gate.baseline(), 7);
        assert_eq!(gate.poll(7, ms(201)), QuietStatus::Waiting);
        assert_eq!(gate.poll(1, ms(399)), QuietStatus::Satisfied);
    }

    #[test]
    fn quiet_window_is_capped() {
        let mut rng = TaskRng::new(1);
        for _ in 0..200 {
            let q = quiet_window_duration(0.2, 5.0, &mut rng);
            assert!(q >= ms(200) && q <= MAX_QUIET_WINDOW);
        }
        assert_eq!(quiet_window_duration(0.25, 0.0, &mut rng), ms(250));
    }

    fn go_no_go() -> ResponseMatrix {
        ResponseMatrix::from_pairs(&[
            (StimulusClass::High, Decision::MovedWheel),
            (StimulusClass::Low, Decision::NoResponse),
        ])
    }

    #[test]
    fn withheld_no_go_is_correct_but_unrewarded() {
        let mut b = bench(TaskKind::GoNoGo, go_no_go(), None, |p| p);
        let r = b
            .machine
            .run(plan(StimulusClass::Low, Decision::NoResponse), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.decision, Decision::NoResponse);
        assert_eq!(r.outcome, TrialOutcome::Correct);
        assert!(!r.rewarded);
        assert_eq!(r.iti, 1.0);
    }

    #[test]
    fn moving_on_no_go_is_punished_without_doubling() {
        let mut b = bench(TaskKind::GoNoGo, go_no_go(), None, |p| p.then(ms(700), -90));
        let r = b
            .machine
            .run(plan(StimulusClass::Low, Decision::NoResponse), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.decision, Decision::MovedWheel);
        assert_eq!(r.side, Some(WheelSide::Left));
        assert_eq!(r.outcome, TrialOutcome::Incorrect);
        assert_eq!(r.iti, 3.0);
        assert_eq!(b.audio.events().last(), Some(&AudioEvent::Blocking { samples: 4000 }));
    }

    #[test]
    fn missed_detection_is_not_punished() {
        let mut b = bench(TaskKind::Detection, ResponseMatrix::detection(), None, |p| p);
        let r = b
            .machine
            .run(plan(StimulusClass::Middle, Decision::MovedWheel), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.outcome, TrialOutcome::Incorrect);
        assert_eq!(r.iti, 3.0);
        assert!(!b
            .audio
            .events()
            .iter()
            .any(|e| matches!(e, AudioEvent::Blocking { .. })));
    }

    #[test]
    fn bias_side_choice_gets_double_reward() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), Some(WheelSide::Left), |p| {
            p.then(ms(600), -120)
        });
        let r = b
            .machine
            .run(plan(StimulusClass::High, Decision::Left), &mut b.curriculum)
            .unwrap();
        assert_eq!(r.reward_ms, 200);
        assert_eq!(b.curriculum.bias_counter(), 1);
        let pumps = read_pump_log(&b.dir.path().join("pump.csv")).unwrap();
        assert_eq!(pumps[0].pump_duration, 200);
    }

    #[test]
    fn consecutive_trials_log_in_order() {
        let mut b = bench(TaskKind::TwoAfc, matrix_high_left(), None, |p| p.then(ms(600), 100));
        let first = plan(StimulusClass::Low, Decision::Right);
        b.machine.run(first, &mut b.curriculum).unwrap();
        // wheel stays at 100: the second trial's reference is 100, so it times out
        let second = TrialPlan { trial_num: 2, ..first };
        let r = b.machine.run(second, &mut b.curriculum).unwrap();
        assert_eq!(r.outcome, TrialOutcome::Omission);
        let rows = read_trial_log(&b.dir.path().join("trials.csv")).unwrap();
        assert_eq!(rows.len(), 8);
        assert!(rows.windows(2).all(|w| w[0].time <= w[1].time));
        let clouds = std::fs::read_to_string(b.dir.path().join("clouds.csv")).unwrap();
        assert_eq!(clouds.lines().count(), 2);
    }

    proptest! {
        #[test]
        fn threshold_is_symmetric(base in -50_000i64..50_000, goal in 1i64..2_000, frac in 0.0f64..1.0) {
            let task = TaskKind::TwoAfc;
            let right = base + goal + 1;
            let left = base - goal - 1;
            prop_assert_eq!(task.classify_wheel(right - base, goal).0, Decision::Right);
            prop_assert_eq!(task.classify_wheel(left - base, goal).0, Decision::Left);

            let inside = base - goal + 1 + ((2 * goal - 2) as f64 * frac) as i64;
            let (d, _) = task.classify_wheel(inside - base, goal);
            prop_assert_eq!(d, Decision::Undecided);
            prop_assert_eq!(task.resolve(d, Decision::Left, false), None);
            prop_assert_eq!(task.resolve(d, Decision::Left, true), Some(TrialOutcome::Omission));
        }
    }
}

//! Between-trial decisions: which stimulus comes next, how much reward the
//! next correct choice earns, and whether the session should keep going.
//!
//! The curriculum owns every running counter of a session. The trial machine
//! reports each finished trial through [`Curriculum::record`]; the stage
//! evaluator reads the counters back through [`Curriculum::tally`].

use std::time::Duration;

use statrs::statistics::{Data, Median};
use tracing::{debug, info};

use crate::config::{ResponseMatrix, TaskPrefs};
use crate::error::Result;
use crate::event_log::{OutcomeCounts, TrialSummary};
use crate::policy::{Decision, StimulusClass, TaskKind, TrialOutcome, WheelSide};
use crate::prng::TaskRng;
use crate::stage::SessionTally;
use crate::storage::EndingCriteria;
use crate::trial::TrialResult;

/// Consecutive correct trials that flip the class at stage 0.
pub const SHAPING_RUN: usize = 3;
/// Decisions averaged by debias, and the trial count it needs first.
pub const DEBIAS_WINDOW: usize = 10;
pub const DEBIAS_SD: f64 = 0.5;
/// Stage-5 trials drawn without block structure.
pub const UNBIASED_TRIALS_STAGE_5: u32 = 90;
/// Go/no-go never presents the same class more than this many times in a row.
pub const MAX_REPEATS: usize = 3;

/// Share of non-omission choices to one side that triggers bias correction.
pub const BIAS_THRESHOLD: f64 = 0.85;

/// Number of strength options (easiest first) per 2AFC stage.
const STRENGTH_OPTIONS: [usize; 6] = [1, 1, 2, 3, 4, 4];

/// Wall-clock and engagement limits of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLimits {
    pub max_duration: Duration,
    /// Past this mark the trial floor and disengagement are checked.
    pub productivity_mark: Duration,
    pub min_trials: u32,
    pub rolling_window: usize,
    /// 2AFC: rolling median RT above this multiple of the session median.
    pub rt_median_factor: f64,
    /// Go/no-go, detection: fewer moves than this in the rolling window.
    pub min_moves: usize,
}

impl SessionLimits {
    pub fn for_task(task: TaskKind) -> Self {
        let (max_min, min_trials) = match task {
            TaskKind::TwoAfc => (90, 350),
            TaskKind::GoNoGo | TaskKind::Detection => (60, 200),
        };
        Self {
            max_duration: Duration::from_secs(max_min * 60),
            productivity_mark: Duration::from_secs(45 * 60),
            min_trials,
            rolling_window: 20,
            rt_median_factor: 4.0,
            min_moves: 4,
        }
    }
}

/// 2AFC stage-5 block: a run of trials skewed toward one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockState {
    /// +1 favours "high", -1 favours "low".
    pub sign: i8,
    pub length: u32,
    pub elapsed: u32,
}

impl BlockState {
    pub const MIN_LENGTH: u32 = 30;
    pub const MAX_LENGTH: u32 = 70;

    pub fn random(rng: &mut TaskRng) -> Self {
        Self {
            sign: rng.sign(),
            length: rng.range_u32(Self::MIN_LENGTH, Self::MAX_LENGTH),
            elapsed: 0,
        }
    }

    pub fn high_probability(&self) -> f64 {
        if self.sign < 0 {
            0.2
        } else {
            0.8
        }
    }

    /// Count one trial; flip sign and redraw the length when the block is full.
    pub fn step(&mut self, rng: &mut TaskRng) {
        self.elapsed += 1;
        if self.elapsed >= self.length {
            self.sign = -self.sign;
            self.length = rng.range_u32(Self::MIN_LENGTH, Self::MAX_LENGTH);
            self.elapsed = 0;
            debug!(sign = self.sign, length = self.length, "new block");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Fixed,
    Uniform,
    /// Stage 0: repeat the previous class.
    Repeat,
    /// Stage 0: switch after a run of correct trials.
    ShapingSwitch,
    Debias,
    Block,
    /// Go/no-go run length cap.
    RepeatCap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassSelection {
    pub class: StimulusClass,
    pub reason: SelectionReason,
}

/// Everything the trial machine needs to know before a trial starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialPlan {
    pub trial_num: u32,
    pub class: StimulusClass,
    pub strength: u8,
    pub required: Decision,
    pub block: i8,
    pub reason: SelectionReason,
}

#[derive(Debug)]
pub struct Curriculum {
    task: TaskKind,
    stage: u8,
    rng: TaskRng,
    matrix: ResponseMatrix,
    strengths: Vec<u8>,
    limits: SessionLimits,
    response_window: f64,

    trials: u32,
    counts: OutcomeCounts,
    last_class: Option<StimulusClass>,
    last_outcome: Option<TrialOutcome>,
    shaping_window: Vec<bool>,
    decision_history: Vec<i8>,
    correct_history: Vec<bool>,
    reaction_times: Vec<f64>,
    moved_history: Vec<bool>,
    class_history: Vec<StimulusClass>,
    block: Option<BlockState>,

    bias_side: Option<WheelSide>,
    bias_counter: u32,
    bias_cap: u32,
}

impl Curriculum {
    pub fn new(
        task: TaskKind,
        stage: u8,
        matrix: ResponseMatrix,
        prefs: &TaskPrefs,
        bias_side: Option<WheelSide>,
        rng: TaskRng,
    ) -> Self {
        Self {
            task,
            stage: stage.min(task.max_stage()),
            rng,
            matrix,
            strengths: prefs.task_prefs.stim_strength.clone(),
            limits: SessionLimits::for_task(task),
            response_window: prefs.task_prefs.response_window,
            trials: 0,
            counts: OutcomeCounts::default(),
            last_class: None,
            last_outcome: None,
            shaping_window: Vec::new(),
            decision_history: Vec::new(),
            correct_history: Vec::new(),
            reaction_times: Vec::new(),
            moved_history: Vec::new(),
            class_history: Vec::new(),
            block: None,
            bias_side,
            bias_counter: 0,
            bias_cap: prefs.task_prefs.bias_counter_max,
        }
    }

    pub fn set_limits(&mut self, limits: SessionLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    /// Completed trials so far.
    pub fn trials(&self) -> u32 {
        self.trials
    }

    pub fn counts(&self) -> OutcomeCounts {
        self.counts
    }

    pub fn block(&self) -> Option<BlockState> {
        self.block
    }

    pub fn bias_side(&self) -> Option<WheelSide> {
        self.bias_side
    }

    pub fn bias_counter(&self) -> u32 {
        self.bias_counter
    }

    pub fn decision_history(&self) -> &[i8] {
        &self.decision_history
    }

    pub fn correct_history(&self) -> &[bool] {
        &self.correct_history
    }

    pub fn shaping_window(&self) -> &[bool] {
        &self.shaping_window
    }

    pub fn response_matrix(&self) -> &ResponseMatrix {
        &self.matrix
    }

    /// Pick class and strength for the next trial.
    pub fn plan_trial(&mut self) -> Result<TrialPlan> {
        let selection = self.select_trial_class();
        let strength = self.select_strength();
        let required = self.matrix.required(selection.class)?;
        Ok(TrialPlan {
            trial_num: self.trials + 1,
            class: selection.class,
            strength,
            required,
            block: self.block.map_or(0, |b| b.sign),
            reason: selection.reason,
        })
    }

    fn uniform_class(&mut self) -> StimulusClass {
        if self.rng.chance(0.5) {
            StimulusClass::High
        } else {
            StimulusClass::Low
        }
    }

    fn pick(class: StimulusClass, reason: SelectionReason) -> ClassSelection {
        ClassSelection { class, reason }
    }

    pub fn select_trial_class(&mut self) -> ClassSelection {
        use SelectionReason::*;
        match self.task {
            TaskKind::Detection => Self::pick(StimulusClass::Middle, Fixed),
            TaskKind::GoNoGo => {
                let class = self.uniform_class();
                let run = &self.class_history;
                let capped = run.len() >= MAX_REPEATS
                    && run[run.len() - MAX_REPEATS..].iter().all(|c| *c == class);
                if capped {
                    Self::pick(class.opposite(), RepeatCap)
                } else {
                    Self::pick(class, Uniform)
                }
            }
            TaskKind::TwoAfc => match self.stage {
                0 => {
                    let last = match self.last_class {
                        Some(c) => c,
                        None => self.uniform_class(),
                    };
                    let w = &self.shaping_window;
                    if w.len() >= SHAPING_RUN && w[w.len() - SHAPING_RUN..].iter().all(|c| *c) {
                        self.shaping_window.clear();
                        Self::pick(last.opposite(), ShapingSwitch)
                    } else {
                        Self::pick(last, Repeat)
                    }
                }
                1..=3 => {
                    if self.last_outcome == Some(TrialOutcome::Incorrect)
                        && self.trials as usize > DEBIAS_WINDOW
                    {
                        let (_, class) = self.debias();
                        Self::pick(class, Debias)
                    } else {
                        let class = self.uniform_class();
                        Self::pick(class, Uniform)
                    }
                }
                4 => {
                    let class = self.uniform_class();
                    Self::pick(class, Uniform)
                }
                _ => self.select_block_class(),
            },
        }
    }

    fn select_block_class(&mut self) -> ClassSelection {
        if self.trials <= UNBIASED_TRIALS_STAGE_5 {
            if self.trials == UNBIASED_TRIALS_STAGE_5 && self.block.is_none() {
                let block = BlockState::random(&mut self.rng);
                info!(sign = block.sign, length = block.length, "block structure starts");
                self.block = Some(block);
            }
            let class = self.uniform_class();
            return Self::pick(class, SelectionReason::Uniform);
        }
        let mut block = match self.block {
            Some(b) => b,
            None => BlockState::random(&mut self.rng),
        };
        let class = if self.rng.chance(block.high_probability()) {
            StimulusClass::High
        } else {
            StimulusClass::Low
        };
        block.step(&mut self.rng);
        self.block = Some(block);
        Self::pick(class, SelectionReason::Block)
    }

    /// Present the class the animal is under-choosing.
    ///
    /// Returns the noised bias estimate (positive = right-biased) and the class
    /// whose required response is opposite the biased side.
    pub fn debias(&mut self) -> (f64, StimulusClass) {
        let recent = &self.decision_history[self.decision_history.len().saturating_sub(DEBIAS_WINDOW)..];
        let mean = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|d| *d as f64).sum::<f64>() / recent.len() as f64
        };
        let value = self.rng.gauss(mean, DEBIAS_SD);
        let biased = if value > 0.0 {
            Decision::Right
        } else {
            Decision::Left
        };
        let class = match self.matrix.class_for(biased) {
            Some(c) => c.opposite(),
            None => self.uniform_class(),
        };
        debug!(mean, value, %class, "debias");
        (value, class)
    }

    pub fn strength_options(&self) -> &[u8] {
        let n = match self.task {
            TaskKind::TwoAfc => STRENGTH_OPTIONS[self.stage.min(5) as usize],
            TaskKind::GoNoGo | TaskKind::Detection => 1,
        };
        &self.strengths[..n.min(self.strengths.len())]
    }

    pub fn select_strength(&mut self) -> u8 {
        let n = match self.task {
            TaskKind::TwoAfc => STRENGTH_OPTIONS[self.stage.min(5) as usize],
            TaskKind::GoNoGo | TaskKind::Detection => 1,
        }
        .min(self.strengths.len());
        match n {
            0 => 100,
            _ => self.strengths[self.rng.index(n)],
        }
    }

    /// Reward multiplier for a rewarded trial: doubled while the animal
    /// chooses the bias-correction side and the per-session cap is not used up.
    pub fn reward_multiplier(&mut self, decision: Decision) -> u32 {
        let side = match decision {
            Decision::Left => Some(WheelSide::Left),
            Decision::Right => Some(WheelSide::Right),
            _ => None,
        };
        if side.is_some() && side == self.bias_side && self.bias_counter < self.bias_cap {
            self.bias_counter += 1;
            2
        } else {
            1
        }
    }

    /// End-of-trial hook.
    pub fn record(&mut self, result: &TrialResult) {
        self.trials += 1;
        self.counts.add(result.outcome);
        self.last_outcome = Some(result.outcome);
        self.last_class = Some(result.class);
        self.class_history.push(result.class);

        let correct = result.outcome == TrialOutcome::Correct;
        self.decision_history.push(result.decision.signed());
        self.correct_history.push(correct);
        if self.stage == 0 {
            self.shaping_window.push(correct);
        }
        self.reaction_times.push(result.reaction_time);
        self.moved_history.push(result.decision == Decision::MovedWheel);
    }

    /// Whether the session should stop after the trial just recorded.
    pub fn continuation(&self, elapsed: Duration) -> Option<EndingCriteria> {
        let l = &self.limits;
        if elapsed > l.max_duration {
            info!("{} min passed, time limit reached", l.max_duration.as_secs() / 60);
            return Some(EndingCriteria::MaxTime);
        }
        if elapsed <= l.productivity_mark {
            return None;
        }
        if self.trials < l.min_trials {
            info!(trials = self.trials, "low number of trials");
            return Some(EndingCriteria::LowTrialNum);
        }
        if self.trials > l.min_trials && self.is_disengaged() {
            info!(trials = self.trials, "animal is disengaged");
            return Some(EndingCriteria::Disengagement);
        }
        None
    }

    pub fn is_disengaged(&self) -> bool {
        let w = self.limits.rolling_window;
        match self.task {
            TaskKind::TwoAfc => {
                if self.reaction_times.len() < w {
                    return false;
                }
                let session = Data::new(self.reaction_times.clone()).median();
                let rolling =
                    Data::new(self.reaction_times[self.reaction_times.len() - w..].to_vec()).median();
                rolling > self.limits.rt_median_factor * session || rolling >= self.response_window
            }
            TaskKind::GoNoGo | TaskKind::Detection => {
                let recent = &self.moved_history[self.moved_history.len().saturating_sub(w)..];
                recent.iter().filter(|m| **m).count() < self.limits.min_moves
            }
        }
    }

    pub fn tally(&self) -> SessionTally {
        SessionTally {
            task: self.task,
            stage: self.stage,
            trials: self.trials,
            counts: self.counts,
            decision_history: self.decision_history.clone(),
            correct_history: self.correct_history.clone(),
        }
    }
}

/// Side to double rewards on, from the previous session's choices.
///
/// More than 85 % of left/right choices to the left means the right side needs
/// encouragement, and vice versa. No choices at all counts as unbiased.
pub fn bias_correction_side(trials: &[TrialSummary]) -> Option<WheelSide> {
    let left = trials.iter().filter(|t| t.decision == Decision::Left).count();
    let right = trials.iter().filter(|t| t.decision == Decision::Right).count();
    let total = left + right;
    let prop_left = if total > 0 {
        left as f64 / total as f64
    } else {
        0.5
    };
    if prop_left > BIAS_THRESHOLD {
        Some(WheelSide::Right)
    } else if prop_left < 1.0 - BIAS_THRESHOLD {
        Some(WheelSide::Left)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_prefs;
    use crate::policy::Choice;

    pub(crate) fn matrix_high_left() -> ResponseMatrix {
        ResponseMatrix::from_pairs(&[
            (StimulusClass::High, Decision::Left),
            (StimulusClass::Low, Decision::Right),
        ])
    }

    fn two_afc(stage: u8, seed: u64) -> Curriculum {
        Curriculum::new(
            TaskKind::TwoAfc,
            stage,
            matrix_high_left(),
            &sample_prefs(),
            None,
            TaskRng::new(seed),
        )
    }

    pub(crate) fn result(class: StimulusClass, decision: Decision, outcome: TrialOutcome) -> TrialResult {
        TrialResult {
            trial_num: 0,
            class,
            strength: 100,
            decision,
            side: None,
            outcome,
            reaction_time: 0.5,
            rewarded: outcome == TrialOutcome::Correct,
            reward_ms: 0,
            iti: 1.0,
            block: 0,
        }
    }

    #[test]
    fn stage_zero_flips_after_three_correct_and_resets_window() {
        let mut c = two_afc(0, 1);
        for _ in 0..3 {
            c.record(&result(StimulusClass::High, Decision::Left, TrialOutcome::Correct));
        }
        assert_eq!(c.shaping_window(), &[true, true, true]);
        let sel = c.select_trial_class();
        assert_eq!(sel.class, StimulusClass::Low);
        assert_eq!(sel.reason, SelectionReason::ShapingSwitch);
        assert!(c.shaping_window().is_empty());
    }

    #[test]
    fn stage_zero_repeats_until_run_completes() {
        let mut c = two_afc(0, 2);
        c.record(&result(StimulusClass::High, Decision::Left, TrialOutcome::Correct));
        c.record(&result(StimulusClass::High, Decision::Right, TrialOutcome::Incorrect));
        c.record(&result(StimulusClass::High, Decision::Left, TrialOutcome::Correct));
        let sel = c.select_trial_class();
        assert_eq!(sel, Curriculum::pick(StimulusClass::High, SelectionReason::Repeat));
    }

    #[test]
    fn stage_one_debiases_after_incorrect_past_ten_trials() {
        let mut c = two_afc(1, 3);
        for _ in 0..14 {
            c.record(&result(StimulusClass::High, Decision::Left, TrialOutcome::Correct));
        }
        c.record(&result(StimulusClass::Low, Decision::Left, TrialOutcome::Incorrect));
        assert_eq!(c.trials(), 15);
        assert_eq!(c.select_trial_class().reason, SelectionReason::Debias);

        // ten or fewer trials: uniform
        let mut c = two_afc(1, 3);
        for _ in 0..10 {
            c.record(&result(StimulusClass::Low, Decision::Left, TrialOutcome::Incorrect));
        }
        assert_eq!(c.select_trial_class().reason, SelectionReason::Uniform);
    }

    #[test]
    fn debias_is_seed_deterministic_and_opposes_bias() {
        let seed = 17;
        let mut c = two_afc(2, seed);
        for i in 0..10 {
            let d = if i < 7 { Decision::Right } else { Decision::Left };
            c.record(&result(StimulusClass::Low, d, TrialOutcome::Correct));
        }
        // mean of 7 x +1 and 3 x -1
        let expected = TaskRng::new(seed).gauss(0.4, DEBIAS_SD);
        let (value, class) = c.debias();
        assert_eq!(value.to_bits(), expected.to_bits());
        // right is mapped to "low"; a right bias presents "high"
        let want = if expected > 0.0 {
            StimulusClass::High
        } else {
            StimulusClass::Low
        };
        assert_eq!(class, want);
    }

    #[test]
    fn stage_five_block_minus_one_gives_high_one_in_five() {
        let mut c = two_afc(5, 5);
        c.trials = 91;
        let draws = 10_000;
        let mut high = 0;
        for _ in 0..draws {
            c.block = Some(BlockState {
                sign: -1,
                length: 1_000,
                elapsed: 0,
            });
            let sel = c.select_trial_class();
            assert_eq!(sel.reason, SelectionReason::Block);
            if sel.class == StimulusClass::High {
                high += 1;
            }
        }
        let p = high as f64 / draws as f64;
        assert!((p - 0.2).abs() < 0.02, "p(high) = {p}");
    }

    #[test]
    fn stage_five_sets_up_block_at_ninety() {
        let mut c = two_afc(5, 6);
        c.trials = 89;
        assert_eq!(c.select_trial_class().reason, SelectionReason::Uniform);
        assert!(c.block().is_none());
        c.trials = 90;
        c.select_trial_class();
        let block = c.block().unwrap();
        assert!(block.sign == 1 || block.sign == -1);
        assert!((30..70).contains(&block.length));
    }

    #[test]
    fn block_flips_when_full() {
        let mut rng = TaskRng::new(8);
        let mut b = BlockState {
            sign: 1,
            length: 2,
            elapsed: 0,
        };
        b.step(&mut rng);
        assert_eq!(b.sign, 1);
        b.step(&mut rng);
        assert_eq!(b.sign, -1);
        assert_eq!(b.elapsed, 0);
        assert!((30..70).contains(&b.length));
    }

    #[test]
    fn go_no_go_caps_runs_at_three() {
        let mut c = Curriculum::new(
            TaskKind::GoNoGo,
            1,
            ResponseMatrix::from_pairs(&[
                (StimulusClass::High, Decision::MovedWheel),
                (StimulusClass::Low, Decision::NoResponse),
            ]),
            &sample_prefs(),
            None,
            TaskRng::new(9),
        );
        let mut run = 0;
        let mut prev = None;
        for _ in 0..500 {
            let sel = c.select_trial_class();
            run = if Some(sel.class) == prev { run + 1 } else { 1 };
            assert!(run <= MAX_REPEATS);
            prev = Some(sel.class);
            c.record(&result(sel.class, Decision::NoResponse, TrialOutcome::Correct));
        }
    }

    #[test]
    fn detection_is_always_middle() {
        let mut c = Curriculum::new(
            TaskKind::Detection,
            0,
            ResponseMatrix::detection(),
            &sample_prefs(),
            None,
            TaskRng::new(10),
        );
        for _ in 0..20 {
            let plan = c.plan_trial().unwrap();
            assert_eq!(plan.class, StimulusClass::Middle);
            assert_eq!(plan.required, Decision::MovedWheel);
            assert_eq!(plan.strength, 100);
        }
    }

    #[test]
    fn strength_options_grow_with_stage() {
        let expect: [&[u8]; 6] = [
            &[100],
            &[100],
            &[100, 80],
            &[100, 80, 70],
            &[100, 80, 70, 60],
            &[100, 80, 70, 60],
        ];
        for (stage, want) in expect.iter().enumerate() {
            let mut c = two_afc(stage as u8, 11);
            assert_eq!(c.strength_options(), *want);
            for _ in 0..50 {
                assert!(want.contains(&c.select_strength()));
            }
        }
    }

    #[test]
    fn double_reward_never_exceeds_cap() {
        let prefs = sample_prefs();
        let cap = prefs.task_prefs.bias_counter_max;
        let mut c = Curriculum::new(
            TaskKind::TwoAfc,
            3,
            matrix_high_left(),
            &prefs,
            Some(WheelSide::Left),
            TaskRng::new(12),
        );
        let doubled = (0..20)
            .map(|_| c.reward_multiplier(Decision::Left))
            .filter(|m| *m == 2)
            .count();
        assert_eq!(doubled as u32, cap);
        assert_eq!(c.reward_multiplier(Decision::Right), 1);
    }

    #[test]
    fn histories_grow_by_one_per_trial() {
        let mut c = two_afc(2, 13);
        for (i, outcome) in [TrialOutcome::Correct, TrialOutcome::Incorrect, TrialOutcome::Omission]
            .into_iter()
            .enumerate()
        {
            c.record(&result(StimulusClass::High, Decision::Undecided, outcome));
            assert_eq!(c.decision_history().len(), i + 1);
            assert_eq!(c.correct_history().len(), i + 1);
        }
        assert_eq!(c.counts(), OutcomeCounts::from([1, 1, 1]));
    }

    #[test]
    fn continuation_limits() {
        let mut c = two_afc(3, 14);
        let min = Duration::from_secs(60);
        assert_eq!(c.continuation(44 * min), None);
        assert_eq!(c.continuation(46 * min), Some(EndingCriteria::LowTrialNum));
        assert_eq!(c.continuation(91 * min), Some(EndingCriteria::MaxTime));

        for _ in 0..400 {
            c.record(&result(StimulusClass::High, Decision::Left, TrialOutcome::Correct));
        }
        assert_eq!(c.continuation(46 * min), None);
        // slow responses over the last 20 trials
        for _ in 0..20 {
            let mut r = result(StimulusClass::High, Decision::Left, TrialOutcome::Correct);
            r.reaction_time = 2.5;
            c.record(&r);
        }
        assert!(c.is_disengaged());
        assert_eq!(c.continuation(46 * min), Some(EndingCriteria::Disengagement));
    }

    #[test]
    fn rolling_median_at_response_window_is_disengagement() {
        let mut c = two_afc(3, 16);
        let min = Duration::from_secs(60);
        let rt = |secs: f64| {
            let mut r = result(StimulusClass::High, Decision::Left, TrialOutcome::Correct);
            r.reaction_time = secs;
            r
        };
        for _ in 0..400 {
            c.record(&rt(5.0));
        }
        // rolling median 7.5 s: below the 10 s window and 4x the session median
        for _ in 0..10 {
            c.record(&rt(10.0));
        }
        assert!(!c.is_disengaged());
        assert_eq!(c.continuation(46 * min), None);

        // rolling median reaches the window while 4x the session median is 20 s
        for _ in 0..10 {
            c.record(&rt(10.0));
        }
        assert!(c.is_disengaged());
        assert_eq!(c.continuation(46 * min), Some(EndingCriteria::Disengagement));
    }

    #[test]
    fn detection_disengages_without_movement() {
        let mut c = Curriculum::new(
            TaskKind::Detection,
            1,
            ResponseMatrix::detection(),
            &sample_prefs(),
            None,
            TaskRng::new(15),
        );
        for _ in 0..20 {
            c.record(&result(StimulusClass::Middle, Decision::MovedWheel, TrialOutcome::Correct));
        }
        assert!(!c.is_disengaged());
        for _ in 0..17 {
            c.record(&result(StimulusClass::Middle, Decision::NoResponse, TrialOutcome::Incorrect));
        }
        assert!(c.is_disengaged());
    }

    fn summary(decision: Decision) -> TrialSummary {
        TrialSummary {
            trial_num: 1,
            trial_type: StimulusClass::High,
            stim_strength: 100,
            decision,
            choice: Choice::Correct,
            left_right: None,
            reward: true,
            block: 0,
            start_time: 0.0,
            tone_onset: None,
            outcome_time: 0.0,
            iti: None,
        }
    }

    #[test]
    fn bias_side_from_previous_choices() {
        let mut trials: Vec<_> = (0..90).map(|_| summary(Decision::Left)).collect();
        trials.extend((0..10).map(|_| summary(Decision::Right)));
        trials.extend((0..50).map(|_| summary(Decision::Undecided)));
        assert_eq!(bias_correction_side(&trials), Some(WheelSide::Right));

        let balanced: Vec<_> = (0..10)
            .map(|i| summary(if i % 2 == 0 { Decision::Left } else { Decision::Right }))
            .collect();
        assert_eq!(bias_correction_side(&balanced), None);
        assert_eq!(bias_correction_side(&[]), None);

        let right: Vec<_> = (0..10).map(|_| summary(Decision::Right)).collect();
        assert_eq!(bias_correction_side(&right), Some(WheelSide::Left));
    }
}

//! Stage advancement, evaluated once when the operator stops a session.
//!
//! Stages 0–3 look only at the session just run. Stage 4 and the stage-5
//! readiness report look at the persisted trial logs of the most recent prior
//! sessions and fit a psychometric curve through a [`PsychometricFit`].

use tracing::{debug, info};

use crate::config::ResponseMatrix;
use crate::error::{Result, RigError};
use crate::event_log::{OutcomeCounts, TrialSummary};
use crate::policy::{Decision, StimulusClass, TaskKind};
use crate::storage::SessionHistory;

/// Signed stimulus strengths (percent toward "right") the curve is fit over.
pub const STIM_LIST: [u8; 8] = [0, 15, 30, 40, 60, 70, 85, 100];

#[derive(Debug, Clone, PartialEq)]
pub struct StageCriteria {
    /// Correct trials needed to leave stage 0.
    pub shaping_correct_2afc: u32,
    pub shaping_correct_other: u32,
    /// Per-side accuracy needed at stage 1 and stage 2.
    pub side_accuracy: [f64; 2],
    pub stage_3_trials: u32,
    /// Prior sessions inspected at stage 4 and for readiness.
    pub history_sessions: usize,
    pub history_min_trials: u32,
    /// Ceiling on right choices at the easiest left stimulus.
    pub easy_wrong_max: f64,
    /// Floor on right choices at the easiest right stimulus.
    pub easy_right_min: f64,
    pub bias_center: f64,
    pub max_bias_offset: f64,
    pub max_slope: f64,
    pub max_lapse: f64,
    /// Minimum bias difference between the two block types for readiness.
    pub min_bias_shift: f64,
}

impl Default for StageCriteria {
    fn default() -> Self {
        Self {
            shaping_correct_2afc: 300,
            shaping_correct_other: 150,
            side_accuracy: [0.8, 0.75],
            stage_3_trials: 350,
            history_sessions: 3,
            history_min_trials: 300,
            easy_wrong_max: 0.2,
            easy_right_min: 0.8,
            bias_center: 50.0,
            max_bias_offset: 16.0,
            max_slope: 19.0,
            max_lapse: 0.2,
            min_bias_shift: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsychometricParams {
    pub bias: f64,
    pub slope: f64,
    pub gamma1: f64,
    pub gamma2: f64,
}

/// Fits `P(right)` against signed stimulus strength.
///
/// Buckets with no left/right decisions carry a count of 0 and a NaN
/// proportion; implementations must skip them. `None` means the fit failed.
pub trait PsychometricFit {
    fn fit(&self, stims: &[f64], counts: &[u32], prob_right: &[f64]) -> Option<PsychometricParams>;
}

/// Right-choice proportions per signed stimulus strength.
#[derive(Debug, Clone, PartialEq)]
pub struct Performance {
    pub stims: Vec<f64>,
    pub counts: Vec<u32>,
    pub prob_right: Vec<f64>,
}

impl Performance {
    /// `right_class` is the class whose required response is "right";
    /// `block` restricts to trials logged in that block.
    pub fn from_trials<'a>(
        trials: impl IntoIterator<Item = &'a TrialSummary>,
        right_class: StimulusClass,
        block: Option<i8>,
    ) -> Self {
        let mut right = [0u32; STIM_LIST.len()];
        let mut left = [0u32; STIM_LIST.len()];
        for t in trials {
            if block.is_some_and(|b| b != t.block) {
                continue;
            }
            let signed = if t.trial_type == right_class {
                t.stim_strength
            } else {
                100u8.saturating_sub(t.stim_strength)
            };
            let Some(i) = STIM_LIST.iter().position(|s| *s == signed) else {
                continue;
            };
            match t.decision {
                Decision::Right => right[i] += 1,
                Decision::Left => left[i] += 1,
                _ => {}
            }
        }
        let counts: Vec<u32> = right.iter().zip(&left).map(|(r, l)| r + l).collect();
        let prob_right = right
            .iter()
            .zip(&counts)
            .map(|(r, n)| if *n == 0 { f64::NAN } else { *r as f64 / *n as f64 })
            .collect();
        Self {
            stims: STIM_LIST.iter().map(|s| *s as f64).collect(),
            counts,
            prob_right,
        }
    }

    /// Few right choices at the easiest left stimulus and many at the easiest
    /// right one. Empty end buckets fail.
    pub fn passes_easy_trials(&self, criteria: &StageCriteria) -> bool {
        let (Some(first), Some(last)) = (self.prob_right.first(), self.prob_right.last()) else {
            return false;
        };
        *first < criteria.easy_wrong_max && *last > criteria.easy_right_min
    }

    pub fn fit(&self, fitter: &dyn PsychometricFit) -> Option<PsychometricParams> {
        fitter.fit(&self.stims, &self.counts, &self.prob_right)
    }
}

/// Counters of the session being stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTally {
    pub task: TaskKind,
    pub stage: u8,
    pub trials: u32,
    pub counts: OutcomeCounts,
    /// +1 right, -1 left, 0 otherwise, per trial.
    pub decision_history: Vec<i8>,
    pub correct_history: Vec<bool>,
}

impl SessionTally {
    /// Fraction correct among trials where the animal chose `side` (+1/-1).
    pub fn side_accuracy(&self, side: i8) -> Option<f64> {
        let picks: Vec<bool> = self
            .decision_history
            .iter()
            .zip(&self.correct_history)
            .filter(|(d, _)| **d == side)
            .map(|(_, c)| *c)
            .collect();
        if picks.is_empty() {
            return None;
        }
        Some(picks.iter().filter(|c| **c).count() as f64 / picks.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDecision {
    pub advance: bool,
    pub next_stage: u8,
    pub ready_for_experiment: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StageEvaluator {
    pub criteria: StageCriteria,
}

impl StageEvaluator {
    pub fn new(criteria: StageCriteria) -> Self {
        Self { criteria }
    }

    /// Decide whether the animal moves up a stage after this session.
    ///
    /// `history` holds the most recent prior sessions, oldest first.
    pub fn evaluate(
        &self,
        tally: &SessionTally,
        history: &[SessionHistory],
        matrix: &ResponseMatrix,
        fitter: &dyn PsychometricFit,
    ) -> Result<StageDecision> {
        let task = tally.task;
        let stage = tally.stage;
        if stage > task.max_stage() {
            return Err(RigError::Stage(format!("{task} has no stage {stage}")));
        }
        let c = &self.criteria;
        let mut ready = false;
        let advance = match (task, stage) {
            (TaskKind::TwoAfc, 0) => tally.counts.correct > c.shaping_correct_2afc,
            (_, 0) => tally.counts.correct > c.shaping_correct_other,
            (TaskKind::TwoAfc, 1 | 2) => {
                let threshold = c.side_accuracy[stage as usize - 1];
                let right = tally.side_accuracy(1);
                let left = tally.side_accuracy(-1);
                debug!(?right, ?left, threshold, "side accuracy");
                right.is_some_and(|a| a >= threshold) && left.is_some_and(|a| a >= threshold)
            }
            (TaskKind::TwoAfc, 3) => tally.trials > c.stage_3_trials,
            (TaskKind::TwoAfc, 4) => self.stage_4_advance(history, matrix, fitter)?,
            (TaskKind::TwoAfc, _) => {
                ready = self.ready_for_experiment(history, matrix, fitter)?;
                false
            }
            // go/no-go and detection stop at stage 1
            (_, _) => false,
        };
        let next_stage = if advance { stage + 1 } else { stage };
        if advance {
            info!("{task}: stage {stage} -> {next_stage}");
        } else {
            info!("{task}: staying at stage {stage}");
        }
        if ready {
            info!("ready for experiment");
        }
        Ok(StageDecision {
            advance,
            next_stage,
            ready_for_experiment: ready,
        })
    }

    fn right_class(matrix: &ResponseMatrix) -> Result<StimulusClass> {
        matrix
            .class_for(Decision::Right)
            .ok_or_else(|| RigError::Stage("response matrix maps no class to 'right'".into()))
    }

    /// The last `history_sessions` sessions, if each was run at `stage` with
    /// enough trials. Fewer sessions than required is a normal "not yet".
    fn qualifying<'a>(&self, history: &'a [SessionHistory], stage: u8) -> Option<&'a [SessionHistory]> {
        let n = self.criteria.history_sessions;
        if history.len() < n {
            debug!(sessions = history.len(), "not enough prior sessions");
            return None;
        }
        let recent = &history[history.len() - n..];
        let ok = recent.iter().all(|h| {
            h.metadata.curr_stage == stage && h.trials.len() as u32 > self.criteria.history_min_trials
        });
        ok.then_some(recent)
    }

    fn fit_passes(&self, params: &PsychometricParams) -> bool {
        let c = &self.criteria;
        (params.bias - c.bias_center).abs() < c.max_bias_offset
            && params.slope < c.max_slope
            && params.gamma1 < c.max_lapse
            && params.gamma2 < c.max_lapse
    }

    pub fn stage_4_advance(
        &self,
        history: &[SessionHistory],
        matrix: &ResponseMatrix,
        fitter: &dyn PsychometricFit,
    ) -> Result<bool> {
        let right_class = Self::right_class(matrix)?;
        let Some(recent) = self.qualifying(history, 4) else {
            return Ok(false);
        };
        let easy = recent
            .iter()
            .all(|h| Performance::from_trials(&h.trials, right_class, Some(0)).passes_easy_trials(&self.criteria));
        if !easy {
            debug!("easy-trial criterion not met");
            return Ok(false);
        }
        let pooled = Performance::from_trials(recent.iter().flat_map(|h| &h.trials), right_class, Some(0));
        let Some(params) = pooled.fit(fitter) else {
            debug!("psychometric fit failed");
            return Ok(false);
        };
        info!(
            bias = params.bias,
            slope = params.slope,
            gamma1 = params.gamma1,
            gamma2 = params.gamma2,
            "psychometric fit"
        );
        Ok(self.fit_passes(&params))
    }

    /// Stage-5 readiness: both block types pass the easy-trial gate in every
    /// session, and the fitted bias moves toward the favoured side by at
    /// least `min_bias_shift`.
    ///
    /// The block favouring "high" is the right-favouring block when "high"
    /// requires a right turn. The shift is `bias(left-favouring) -
    /// bias(right-favouring)`, positive when the animal follows the block.
    pub fn ready_for_experiment(
        &self,
        history: &[SessionHistory],
        matrix: &ResponseMatrix,
        fitter: &dyn PsychometricFit,
    ) -> Result<bool> {
        let right_class = Self::right_class(matrix)?;
        let Some(recent) = self.qualifying(history, 5) else {
            return Ok(false);
        };
        // block +1 favours "high"
        let right_block: i8 = if right_class == StimulusClass::High { 1 } else { -1 };
        let left_block = -right_block;

        for block in [right_block, left_block] {
            let easy = recent.iter().all(|h| {
                Performance::from_trials(&h.trials, right_class, Some(block)).passes_easy_trials(&self.criteria)
            });
            if !easy {
                debug!(block, "easy-trial criterion not met");
                return Ok(false);
            }
        }
        let fit_block = |block: i8| {
            Performance::from_trials(recent.iter().flat_map(|h| &h.trials), right_class, Some(block)).fit(fitter)
        };
        let (Some(right_fit), Some(left_fit)) = (fit_block(right_block), fit_block(left_block)) else {
            return Ok(false);
        };
        let shift = left_fit.bias - right_fit.bias;
        let lapses_ok = [right_fit, left_fit]
            .iter()
            .all(|p| p.gamma1 < self.criteria.max_lapse && p.gamma2 < self.criteria.max_lapse);
        info!(shift, "bias shift between blocks");
        Ok(shift > self.criteria.min_bias_shift && lapses_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::tests::matrix_high_left;
    use crate::policy::Choice;
    use crate::storage::tests::metadata;
    use crate::storage::SessionDir;

    struct FixedFit(PsychometricParams);

    impl PsychometricFit for FixedFit {
        fn fit(&self, _: &[f64], _: &[u32], _: &[f64]) -> Option<PsychometricParams> {
            Some(self.0)
        }
    }

    /// Fits `bias` to the proportion at the 50/50 bucket pair, for block tests.
    struct BlockFit;

    impl PsychometricFit for BlockFit {
        fn fit(&self, _: &[f64], _: &[u32], prob_right: &[f64]) -> Option<PsychometricParams> {
            let mid = (prob_right[3] + prob_right[4]) / 2.0;
            Some(PsychometricParams {
                bias: 100.0 - 100.0 * mid,
                slope: 10.0,
                gamma1: 0.05,
                gamma2: 0.05,
            })
        }
    }

    const GOOD: PsychometricParams = PsychometricParams {
        bias: 52.0,
        slope: 10.0,
        gamma1: 0.1,
        gamma2: 0.1,
    };

    fn trial(class: StimulusClass, strength: u8, decision: Decision, block: i8) -> TrialSummary {
        TrialSummary {
            trial_num: 1,
            trial_type: class,
            stim_strength: strength,
            decision,
            choice: Choice::Correct,
            left_right: None,
            reward: true,
            block,
            start_time: 0.0,
            tone_onset: None,
            outcome_time: 0.0,
            iti: None,
        }
    }

    /// Easy trials answered perfectly: "low" requires right under `matrix_high_left`.
    fn expert_trials(n: usize, block: i8) -> Vec<TrialSummary> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    trial(StimulusClass::Low, 100, Decision::Right, block)
                } else {
                    trial(StimulusClass::High, 100, Decision::Left, block)
                }
            })
            .collect()
    }

    fn history(stage: u8, trials: Vec<TrialSummary>) -> SessionHistory {
        SessionHistory {
            dir: SessionDir::from_path("/nonexistent/20240501/090000"),
            metadata: metadata("m1", stage, false),
            trials,
        }
    }

    fn tally(stage: u8) -> SessionTally {
        SessionTally {
            task: TaskKind::TwoAfc,
            stage,
            trials: 0,
            counts: OutcomeCounts::default(),
            decision_history: Vec::new(),
            correct_history: Vec::new(),
        }
    }

    #[test]
    fn three_good_stage_four_sessions_advance() {
        let hist: Vec<_> = (0..3).map(|_| history(4, expert_trials(302, 0))).collect();
        let eval = StageEvaluator::default();
        let d = eval
            .evaluate(&tally(4), &hist, &matrix_high_left(), &FixedFit(GOOD))
            .unwrap();
        assert!(d.advance);
        assert_eq!(d.next_stage, 5);
    }

    #[test]
    fn stage_four_needs_three_qualifying_sessions() {
        let eval = StageEvaluator::default();
        let m = matrix_high_left();
        let fit = FixedFit(GOOD);

        let two: Vec<_> = (0..2).map(|_| history(4, expert_trials(302, 0))).collect();
        assert!(!eval.stage_4_advance(&two, &m, &fit).unwrap());

        let mut short: Vec<_> = (0..3).map(|_| history(4, expert_trials(302, 0))).collect();
        short[1] = history(4, expert_trials(300, 0));
        assert!(!eval.stage_4_advance(&short, &m, &fit).unwrap());

        let mut wrong_stage: Vec<_> = (0..3).map(|_| history(4, expert_trials(302, 0))).collect();
        wrong_stage[0] = history(3, expert_trials(302, 0));
        assert!(!eval.stage_4_advance(&wrong_stage, &m, &fit).unwrap());
    }

    #[test]
    fn stage_four_rejects_poor_fit() {
        let hist: Vec<_> = (0..3).map(|_| history(4, expert_trials(302, 0))).collect();
        let eval = StageEvaluator::default();
        let m = matrix_high_left();
        for params in [
            PsychometricParams { bias: 70.0, ..GOOD },
            PsychometricParams { slope: 19.0, ..GOOD },
            PsychometricParams { gamma2: 0.25, ..GOOD },
        ] {
            assert!(!eval.stage_4_advance(&hist, &m, &FixedFit(params)).unwrap());
        }
    }

    #[test]
    fn empty_bucket_is_nan_with_zero_count() {
        let trials = vec![
            trial(StimulusClass::Low, 100, Decision::Right, 0),
            trial(StimulusClass::Low, 100, Decision::Left, 0),
            trial(StimulusClass::High, 85, Decision::Undecided, 0),
            trial(StimulusClass::High, 100, Decision::Left, 1),
        ];
        let perf = Performance::from_trials(&trials, StimulusClass::Low, Some(0));
        assert_eq!(perf.counts, vec![0, 0, 0, 0, 0, 0, 0, 2]);
        assert!(perf.prob_right[0].is_nan());
        assert!(perf.prob_right[1].is_nan());
        assert_eq!(perf.prob_right[7], 0.5);
        assert!(!perf.passes_easy_trials(&StageCriteria::default()));
    }

    #[test]
    fn early_stages_use_current_session() {
        let eval = StageEvaluator::default();
        let m = matrix_high_left();
        let fit = FixedFit(GOOD);

        let mut t = tally(0);
        t.counts = OutcomeCounts::from([300, 0, 0]);
        assert!(!eval.evaluate(&t, &[], &m, &fit).unwrap().advance);
        t.counts = OutcomeCounts::from([301, 0, 0]);
        assert!(eval.evaluate(&t, &[], &m, &fit).unwrap().advance);

        let mut t = tally(1);
        // right: 4/5 correct, left: 4/4 correct
        t.decision_history = vec![1, 1, 1, 1, 1, -1, -1, -1, -1];
        t.correct_history = vec![true, true, true, true, false, true, true, true, true];
        assert!(eval.evaluate(&t, &[], &m, &fit).unwrap().advance);
        t.correct_history[0] = false;
        assert!(!eval.evaluate(&t, &[], &m, &fit).unwrap().advance);

        let mut t = tally(3);
        t.trials = 351;
        assert!(eval.evaluate(&t, &[], &m, &fit).unwrap().advance);
    }

    #[test]
    fn one_stage_tasks_stop_at_one() {
        let eval = StageEvaluator::default();
        let m = ResponseMatrix::detection();
        let mut t = tally(0);
        t.task = TaskKind::Detection;
        t.counts = OutcomeCounts::from([151, 0, 0]);
        assert_eq!(eval.evaluate(&t, &[], &m, &FixedFit(GOOD)).unwrap().next_stage, 1);
        t.stage = 1;
        assert!(!eval.evaluate(&t, &[], &m, &FixedFit(GOOD)).unwrap().advance);
        t.stage = 2;
        assert!(matches!(
            eval.evaluate(&t, &[], &m, &FixedFit(GOOD)),
            Err(RigError::Stage(_))
        ));
    }

    fn block_session(follow: bool) -> Vec<TrialSummary> {
        // "low" requires right, so block -1 (favours low) is right-favouring.
        let mut trials = Vec::new();
        for block in [1i8, -1] {
            trials.extend(expert_trials(160, block));
            // ambiguous 60 % "low" trials: answer with the block when following
            for i in 0..20 {
                let goes_right = if follow { block == -1 } else { i % 2 == 0 };
                let d = if goes_right { Decision::Right } else { Decision::Left };
                trials.push(trial(StimulusClass::Low, 60, d, block));
                trials.push(trial(StimulusClass::High, 60, d, block));
            }
        }
        trials
    }

    #[test]
    fn readiness_requires_bias_shift_between_blocks() {
        let eval = StageEvaluator::default();
        let m = matrix_high_left();

        let following: Vec<_> = (0..3).map(|_| history(5, block_session(true))).collect();
        assert!(eval.ready_for_experiment(&following, &m, &BlockFit).unwrap());
        let d = eval.evaluate(&tally(5), &following, &m, &BlockFit).unwrap();
        assert!(d.ready_for_experiment);
        assert!(!d.advance);
        assert_eq!(d.next_stage, 5);

        let ignoring: Vec<_> = (0..3).map(|_| history(5, block_session(false))).collect();
        assert!(!eval.ready_for_experiment(&ignoring, &m, &BlockFit).unwrap());
    }
}

//! Task variants and the rules that differ between them.
//!
//! The three task variants share one trial machine and one curriculum; what
//! differs (how wheel movement is classified, how a raw decision becomes an
//! outcome, which outcomes are rewarded or punished, the ITI table and the
//! number of stages) is answered here by matching on [`TaskKind`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "auditory_2afc")]
    TwoAfc,
    #[serde(rename = "auditory_gonogo")]
    GoNoGo,
    #[serde(rename = "auditory_detection")]
    Detection,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::TwoAfc, TaskKind::GoNoGo, TaskKind::Detection];

    /// Procedure name as written to metadata and used for prefs file names.
    pub fn procedure(self) -> &'static str {
        match self {
            TaskKind::TwoAfc => "auditory_2afc",
            TaskKind::GoNoGo => "auditory_gonogo",
            TaskKind::Detection => "auditory_detection",
        }
    }

    /// Accepts either the full procedure name or `2afc` / `gonogo` / `detection`.
    pub fn from_short_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let short = name.strip_prefix("auditory_").unwrap_or(&name);
        match short {
            "2afc" => Some(TaskKind::TwoAfc),
            "gonogo" | "go_nogo" => Some(TaskKind::GoNoGo),
            "detection" => Some(TaskKind::Detection),
            _ => None,
        }
    }

    pub fn max_stage(self) -> u8 {
        match self {
            TaskKind::TwoAfc => 5,
            TaskKind::GoNoGo | TaskKind::Detection => 1,
        }
    }

    /// The response pair a response matrix for this task must map onto.
    pub fn responses(self) -> [Decision; 2] {
        match self {
            TaskKind::TwoAfc => [Decision::Left, Decision::Right],
            TaskKind::GoNoGo | TaskKind::Detection => [Decision::MovedWheel, Decision::NoResponse],
        }
    }

    /// Classify a wheel displacement relative to the tone-onset reference.
    ///
    /// Crossing requires `|delta| > goal`; a displacement of exactly `goal` is
    /// still undecided.
    pub fn classify_wheel(self, delta: i64, goal: i64) -> (Decision, Option<WheelSide>) {
        let side = if delta > goal {
            Some(WheelSide::Right)
        } else if delta < -goal {
            Some(WheelSide::Left)
        } else {
            None
        };
        match (self, side) {
            (_, None) => (Decision::Undecided, None),
            (TaskKind::TwoAfc, Some(WheelSide::Right)) => (Decision::Right, side),
            (TaskKind::TwoAfc, Some(_)) => (Decision::Left, side),
            (_, Some(_)) => (Decision::MovedWheel, side),
        }
    }

    /// Raw decision recorded when the response window expires without a crossing.
    pub fn on_deadline(self) -> Decision {
        match self {
            TaskKind::TwoAfc => Decision::Undecided,
            TaskKind::GoNoGo | TaskKind::Detection => Decision::NoResponse,
        }
    }

    /// Resolve a raw decision against the required response.
    ///
    /// Returns `None` while the trial is still open (no commitment, deadline not
    /// reached).
    pub fn resolve(self, raw: Decision, required: Decision, expired: bool) -> Option<TrialOutcome> {
        if raw.is_committed() {
            return Some(if raw == required {
                TrialOutcome::Correct
            } else {
                TrialOutcome::Incorrect
            });
        }
        if !expired {
            return None;
        }
        match self {
            TaskKind::TwoAfc => Some(TrialOutcome::Omission),
            TaskKind::GoNoGo | TaskKind::Detection => Some(if required == Decision::NoResponse {
                TrialOutcome::Correct
            } else {
                TrialOutcome::Incorrect
            }),
        }
    }

    /// Whether this outcome earns a reward. Correct withholding in a no-go
    /// trial is not rewarded.
    pub fn rewards(self, outcome: TrialOutcome, raw: Decision) -> bool {
        match self {
            TaskKind::TwoAfc | TaskKind::Detection => outcome == TrialOutcome::Correct,
            TaskKind::GoNoGo => outcome == TrialOutcome::Correct && raw == Decision::MovedWheel,
        }
    }

    /// Whether the punishment tone plays before the ITI.
    pub fn punishes(self, outcome: TrialOutcome, required: Decision) -> bool {
        match self {
            TaskKind::TwoAfc => outcome != TrialOutcome::Correct,
            TaskKind::GoNoGo => {
                outcome == TrialOutcome::Incorrect && required == Decision::NoResponse
            }
            TaskKind::Detection => false,
        }
    }

    /// ITI in seconds for an outcome. Only the 2AFC task doubles the penalty
    /// for an incorrect choice.
    pub fn iti_for(self, outcome: TrialOutcome, table: ItiTable) -> f64 {
        match (self, outcome) {
            (_, TrialOutcome::Correct) => table.correct,
            (TaskKind::TwoAfc, TrialOutcome::Incorrect) => 2.0 * table.penalty,
            _ => table.penalty,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.procedure())
    }
}

/// Configured `[correct, penalty]` inter-trial intervals, seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItiTable {
    pub correct: f64,
    pub penalty: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulusClass {
    High,
    Low,
    Middle,
}

impl StimulusClass {
    /// Index into `[low, middle, high]` octave ranges.
    pub fn target_octave(self) -> usize {
        match self {
            StimulusClass::Low => 0,
            StimulusClass::Middle => 1,
            StimulusClass::High => 2,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            StimulusClass::High => StimulusClass::Low,
            StimulusClass::Low => StimulusClass::High,
            StimulusClass::Middle => StimulusClass::Middle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StimulusClass::High => "high",
            StimulusClass::Low => "low",
            StimulusClass::Middle => "middle",
        }
    }
}

impl fmt::Display for StimulusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw wheel outcome of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Left,
    Right,
    Undecided,
    MovedWheel,
    NoResponse,
}

impl Decision {
    pub fn is_committed(self) -> bool {
        matches!(self, Decision::Left | Decision::Right | Decision::MovedWheel)
    }

    /// +1 right, -1 left, 0 otherwise.
    pub fn signed(self) -> i8 {
        match self {
            Decision::Right => 1,
            Decision::Left => -1,
            _ => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Left => "left",
            Decision::Right => "right",
            Decision::Undecided => "undecided",
            Decision::MovedWheel => "moved_wheel",
            Decision::NoResponse => "no_response",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction the wheel crossed the goal, recorded next to non-evaluative
/// decisions such as `moved_wheel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WheelSide {
    Left,
    Right,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Correct,
    Incorrect,
    Omission,
}

impl TrialOutcome {
    /// Column value written to the trial log.
    pub fn choice(self) -> Choice {
        match self {
            TrialOutcome::Correct => Choice::Correct,
            TrialOutcome::Incorrect => Choice::Incorrect,
            TrialOutcome::Omission => Choice::Undecided,
        }
    }
}

/// Resolved outcome as it appears in the trial log `choice` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    Correct,
    Incorrect,
    Undecided,
}

//! Append-only session logs.
//!
//! Every log is a CSV file opened in append mode; the header is written only
//! when the file is new and each row is flushed as soon as it is written, so
//! whatever is on disk when the process dies is the session's true history.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RigError};
use crate::policy::{Choice, Decision, StimulusClass, TrialOutcome, WheelSide};
use crate::reward::PumpRecord;

fn open_append(path: &Path) -> Result<(File, bool)> {
    let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok((file, fresh))
}

/// Single-writer CSV log of `R` rows.
pub struct CsvLog<R> {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows: PhantomData<fn(&R)>,
}

impl<R: Serialize> CsvLog<R> {
    pub fn create(path: &Path) -> Result<Self> {
        let (file, fresh) = open_append(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            rows: PhantomData,
        })
    }

    pub fn append(&mut self, row: &R) -> Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R> fmt::Debug for CsvLog<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsvLog").field("path", &self.path).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Trial rows
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    TrialStart,
    ToneOnset,
    Outcome,
    ItiComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Unix seconds.
    pub time: f64,
    pub trial_num: u32,
    pub phase: Phase,
    pub trial_type: StimulusClass,
    pub stim_strength: u8,
    pub decision: Option<Decision>,
    pub choice: Option<Choice>,
    pub left_right: Option<WheelSide>,
    pub reward: bool,
    pub inter_trial_interval: Option<f64>,
    pub block: i8,
}

/// Trial log that refuses rows out of phase order.
#[derive(Debug)]
pub struct TrialEventLog {
    log: CsvLog<TrialRecord>,
    last: Option<(u32, Phase)>,
    last_time: f64,
}

impl TrialEventLog {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            log: CsvLog::create(path)?,
            last: None,
            last_time: f64::NEG_INFINITY,
        })
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn append(&mut self, row: &TrialRecord) -> Result<()> {
        let ok = match (self.last, row.phase) {
            (None, Phase::TrialStart) => true,
            (Some((n, Phase::ItiComplete)), Phase::TrialStart) => row.trial_num > n,
            (Some((n, prev)), phase) if n == row.trial_num => matches!(
                (prev, phase),
                (Phase::TrialStart, Phase::ToneOnset)
                    | (Phase::TrialStart, Phase::Outcome)
                    | (Phase::ToneOnset, Phase::Outcome)
                    | (Phase::Outcome, Phase::ItiComplete)
            ),
            _ => false,
        };
        if !ok {
            return Err(RigError::EventOrder(format!(
                "{:?} for trial {} after {:?}",
                row.phase, row.trial_num, self.last
            )));
        }
        if row.time < self.last_time {
            return Err(RigError::EventOrder(format!(
                "trial {} {:?} timestamp {} precedes {}",
                row.trial_num, row.phase, row.time, self.last_time
            )));
        }
        self.log.append(row)?;
        self.last = Some((row.trial_num, row.phase));
        self.last_time = row.time;
        Ok(())
    }
}

pub fn read_trial_log(path: &Path) -> Result<Vec<TrialRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// One row per generated cloud: the tone frequencies in order.
#[derive(Debug)]
pub struct ToneCloudLog {
    writer: csv::Writer<File>,
}

impl ToneCloudLog {
    pub fn create(path: &Path) -> Result<Self> {
        let (file, _) = open_append(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        Ok(Self { writer })
    }

    pub fn append(&mut self, frequencies: &[f64]) -> Result<()> {
        self.writer
            .write_record(frequencies.iter().map(|f| format!("{f:.6}")))?;
        self.writer.flush()?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Read-back
// ─────────────────────────────────────────────────────────────────────────

/// A completed trial folded from its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSummary {
    pub trial_num: u32,
    pub trial_type: StimulusClass,
    pub stim_strength: u8,
    pub decision: Decision,
    pub choice: Choice,
    pub left_right: Option<WheelSide>,
    pub reward: bool,
    pub block: i8,
    pub start_time: f64,
    pub tone_onset: Option<f64>,
    pub outcome_time: f64,
    pub iti: Option<f64>,
}

impl TrialSummary {
    /// Seconds from tone onset to the outcome row.
    pub fn reaction_time(&self) -> Option<f64> {
        self.tone_onset.map(|t| self.outcome_time - t)
    }
}

/// Fold rows into trials. Trials without an outcome row (killed mid-trial)
/// are dropped.
pub fn summarize_trials(records: &[TrialRecord]) -> Vec<TrialSummary> {
    let mut out: Vec<TrialSummary> = Vec::new();
    let mut start: Option<(u32, f64)> = None;
    let mut onset: Option<f64> = None;

    for r in records {
        match r.phase {
            Phase::TrialStart => {
                start = Some((r.trial_num, r.time));
                onset = None;
            }
            Phase::ToneOnset => onset = Some(r.time),
            Phase::Outcome => {
                let (Some(decision), Some(choice)) = (r.decision, r.choice) else {
                    continue;
                };
                let start_time = match start {
                    Some((n, t)) if n == r.trial_num => t,
                    _ => r.time,
                };
                out.push(TrialSummary {
                    trial_num: r.trial_num,
                    trial_type: r.trial_type,
                    stim_strength: r.stim_strength,
                    decision,
                    choice,
                    left_right: r.left_right,
                    reward: r.reward,
                    block: r.block,
                    start_time,
                    tone_onset: onset,
                    outcome_time: r.time,
                    iti: None,
                });
            }
            Phase::ItiComplete => {
                if let Some(last) = out.last_mut().filter(|t| t.trial_num == r.trial_num) {
                    last.iti = r.inter_trial_interval;
                }
            }
        }
    }
    out
}

/// `[correct, incorrect, omission]` counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct OutcomeCounts {
    pub correct: u32,
    pub incorrect: u32,
    pub omission: u32,
}

impl OutcomeCounts {
    pub fn add(&mut self, outcome: TrialOutcome) {
        match outcome {
            TrialOutcome::Correct => self.correct += 1,
            TrialOutcome::Incorrect => self.incorrect += 1,
            TrialOutcome::Omission => self.omission += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.correct + self.incorrect + self.omission
    }

    pub fn from_trials(trials: &[TrialSummary]) -> Self {
        let mut c = Self::default();
        for t in trials {
            c.add(match t.choice {
                Choice::Correct => TrialOutcome::Correct,
                Choice::Incorrect => TrialOutcome::Incorrect,
                Choice::Undecided => TrialOutcome::Omission,
            });
        }
        c
    }
}

impl From<[u32; 3]> for OutcomeCounts {
    fn from([correct, incorrect, omission]: [u32; 3]) -> Self {
        Self {
            correct,
            incorrect,
            omission,
        }
    }
}

impl From<OutcomeCounts> for [u32; 3] {
    fn from(c: OutcomeCounts) -> Self {
        [c.correct, c.incorrect, c.omission]
    }
}

/// Text summary printed after a session stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub outcomes: OutcomeCounts,
    pub trial_types: BTreeMap<String, u32>,
    pub decisions: BTreeMap<String, u32>,
    pub volume_ul: f64,
}

impl SessionSummary {
    pub fn from_logs(trials: &[TrialSummary], pumps: &[PumpRecord], ms_per_ul: f64) -> Self {
        let mut summary = Self {
            outcomes: OutcomeCounts::from_trials(trials),
            ..Self::default()
        };
        for t in trials {
            *summary.trial_types.entry(t.trial_type.to_string()).or_default() += 1;
            *summary.decisions.entry(t.decision.to_string()).or_default() += 1;
        }
        if ms_per_ul > 0.0 {
            summary.volume_ul = pumps.iter().map(|p| p.pump_duration as f64).sum::<f64>() / ms_per_ul;
        }
        summary
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.outcomes;
        writeln!(f, "trials: {}", o.total())?;
        writeln!(
            f,
            "  correct {} | incorrect {} | omission {}",
            o.correct, o.incorrect, o.omission
        )?;
        write!(f, "trial types:")?;
        for (k, v) in &self.trial_types {
            write!(f, " {k}={v}")?;
        }
        writeln!(f)?;
        write!(f, "decisions:")?;
        for (k, v) in &self.decisions {
            write!(f, " {k}={v}")?;
        }
        writeln!(f)?;
        write!(f, "water consumed: {:.1} µl", self.volume_ul)
    }
}

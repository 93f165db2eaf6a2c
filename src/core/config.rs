//! Preference documents.
//!
//! All of these are loaded once when a session is constructed and are
//! immutable afterwards. A missing or malformed document is fatal; the only
//! documented substitution is the default pump calibration.

use std::fs;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RigError};
use crate::policy::{Decision, ItiTable, StimulusClass, TaskKind};
use crate::position::TICKS_PER_DEGREE;
use crate::prng::TaskRng;

/// Pump calibration used when no calibration file exists, ms per µl.
pub const DEFAULT_MS_PER_UL: f64 = 50.0;

/// Stage 0 divides the turning goal by this factor.
pub const STAGE_0_GOAL_DIVISOR: f64 = 2.0;

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(RigError::MissingConfig(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| RigError::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn invalid(path: &Path, reason: impl Into<String>) -> RigError {
    RigError::Config {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Rig settings
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigSettings {
    pub base_params: BaseParams,
    #[serde(default)]
    pub pin_map: PinMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseParams {
    /// Audio output sample rate, Hz.
    pub tone_sampling_rate: u32,
    /// Position recorder rate, Hz.
    pub rotary_rate: f64,
    pub camera_trigger_rate: f64,
    #[serde(rename = "2p_sync_rate")]
    pub sync_rate: f64,
}

/// Pin numbers by role. Only the hardware layer interprets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinMap {
    #[serde(rename = "IN", default)]
    pub inputs: HashMap<String, u32>,
    #[serde(rename = "OUT", default)]
    pub outputs: HashMap<String, u32>,
}

impl RigSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let settings: RigSettings = read_json(path)?;
        settings.validate(path)?;
        Ok(settings)
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        let p = &self.base_params;
        if p.tone_sampling_rate == 0 {
            return Err(invalid(path, "tone_sampling_rate must be positive"));
        }
        for (name, rate) in [
            ("rotary_rate", p.rotary_rate),
            ("camera_trigger_rate", p.camera_trigger_rate),
            ("2p_sync_rate", p.sync_rate),
        ] {
            if !(rate > 0.0) {
                return Err(invalid(path, format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Task preferences
// ─────────────────────────────────────────────────────────────────────────

/// `[start_pitch, stop_pitch, count]`, semitones relative to middle C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OctaveRange(pub f64, pub f64, pub usize);

impl OctaveRange {
    /// Evenly spaced pitch grid including both ends.
    pub fn pitches(&self) -> Vec<f64> {
        let OctaveRange(start, stop, n) = *self;
        match n {
            0 => Vec::new(),
            1 => vec![start],
            _ => (0..n)
                .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParams {
    /// Tone repetition rate used to compute the tone count of a cloud.
    pub tone_fs: f64,
    /// Single tone length, seconds.
    pub tone_duration: f64,
    pub tone_amplitude: f64,
    /// Tone cloud length, seconds.
    pub cloud_duration: f64,
    /// Output sample range of a cloud after scaling.
    pub cloud_range: [i32; 2],
    pub low_octave: OctaveRange,
    pub middle_octave: OctaveRange,
    pub high_octave: OctaveRange,
    /// Target-octave percentages, easiest first.
    pub stim_strength: Vec<u8>,
    /// `[max, min]` reward volume in µl.
    pub reward_size: [f64; 2],
    /// `[correct, penalty]` seconds.
    pub inter_trial_interval: [f64; 2],
    pub response_window: f64,
    /// `[base, exponential scale]` seconds.
    pub quiet_window: [f64; 2],
    /// Punishment tone frequency; -1 is white noise.
    pub punishment_sound: f64,
    pub punishment_sound_duration: f64,
    pub punishment_sound_amplitude: f64,
    /// Per-session cap on doubled rewards for the bias-correction side.
    pub bias_counter_max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSpecs {
    /// Turning goal, degrees of wheel rotation.
    pub target_degrees: f64,
    /// Quiet-window tolerance, degrees.
    #[serde(alias = "quite_jitter")]
    pub quiet_jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPrefs {
    pub task_prefs: TaskParams,
    pub encoder_specs: EncoderSpecs,
}

impl TaskPrefs {
    pub fn load(path: &Path) -> Result<Self> {
        let prefs: TaskPrefs = read_json(path)?;
        prefs.validate(path)?;
        Ok(prefs)
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        let t = &self.task_prefs;
        if t.stim_strength.is_empty() {
            return Err(invalid(path, "stim_strength table is empty"));
        }
        if t.stim_strength.iter().any(|&s| s > 100) {
            return Err(invalid(path, "stim_strength entries are percentages"));
        }
        for (name, v) in [
            ("tone_fs", t.tone_fs),
            ("tone_duration", t.tone_duration),
            ("cloud_duration", t.cloud_duration),
            ("response_window", t.response_window),
            ("punishment_sound_duration", t.punishment_sound_duration),
        ] {
            if !(v > 0.0) {
                return Err(invalid(path, format!("{name} must be positive")));
            }
        }
        for (name, octave) in [
            ("low_octave", t.low_octave),
            ("middle_octave", t.middle_octave),
            ("high_octave", t.high_octave),
        ] {
            if octave.2 == 0 {
                return Err(invalid(path, format!("{name} has no pitches")));
            }
        }
        if t.cloud_range[0] >= t.cloud_range[1] {
            return Err(invalid(path, "cloud_range must be [min, max]"));
        }
        if t.reward_size[0] < t.reward_size[1] || t.reward_size[1] <= 0.0 {
            return Err(invalid(path, "reward_size must be [max, min] with min > 0"));
        }
        if t.quiet_window.iter().any(|v| *v < 0.0) {
            return Err(invalid(path, "quiet_window entries must be non-negative"));
        }
        if self.encoder_specs.target_degrees <= 0.0 || self.encoder_specs.quiet_jitter < 0.0 {
            return Err(invalid(path, "encoder_specs out of range"));
        }
        Ok(())
    }

    /// Decision threshold in encoder ticks, halved at stage 0.
    pub fn turning_goal(&self, stage: u8) -> i64 {
        let mut goal = TICKS_PER_DEGREE * self.encoder_specs.target_degrees;
        if stage == 0 {
            goal /= STAGE_0_GOAL_DIVISOR;
        }
        goal.floor() as i64
    }

    pub fn quiet_jitter_ticks(&self) -> i64 {
        (TICKS_PER_DEGREE * self.encoder_specs.quiet_jitter).round() as i64
    }

    pub fn iti(&self) -> ItiTable {
        let [correct, penalty] = self.task_prefs.inter_trial_interval;
        ItiTable { correct, penalty }
    }

    pub fn octaves(&self) -> [OctaveRange; 3] {
        let t = &self.task_prefs;
        [t.low_octave, t.middle_octave, t.high_octave]
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Response matrix
// ─────────────────────────────────────────────────────────────────────────

/// Stimulus class → required response for one animal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseMatrix(pub HashMap<StimulusClass, Decision>);

impl ResponseMatrix {
    pub fn from_pairs(pairs: &[(StimulusClass, Decision)]) -> Self {
        Self(pairs.iter().copied().collect())
    }

    /// The fixed detection mapping: the middle octave always requires movement.
    pub fn detection() -> Self {
        Self::from_pairs(&[(StimulusClass::Middle, Decision::MovedWheel)])
    }

    pub fn required(&self, class: StimulusClass) -> Result<Decision> {
        self.0
            .get(&class)
            .copied()
            .ok_or_else(|| RigError::ResponseMatrix(format!("no response mapped for class {class}")))
    }

    /// Class whose required response is `response`.
    pub fn class_for(&self, response: Decision) -> Option<StimulusClass> {
        let mut classes: Vec<_> = self
            .0
            .iter()
            .filter(|(_, d)| **d == response)
            .map(|(c, _)| *c)
            .collect();
        classes.sort();
        classes.first().copied()
    }

    pub fn validate_for(&self, task: TaskKind) -> Result<()> {
        if task == TaskKind::Detection {
            return self.required(StimulusClass::Middle).map(|_| ());
        }
        let high = self.required(StimulusClass::High)?;
        let low = self.required(StimulusClass::Low)?;
        let allowed = task.responses();
        if !allowed.contains(&high) || !allowed.contains(&low) || high == low {
            return Err(RigError::ResponseMatrix(format!(
                "{task} needs high/low mapped to distinct {} / {} responses, got {high} / {low}",
                allowed[0], allowed[1]
            )));
        }
        Ok(())
    }

    /// Random counterbalanced assignment of the task's two responses to
    /// high/low, with the reversal mapping swapped.
    pub fn counterbalanced(task: TaskKind, rng: &mut TaskRng) -> ResponseMatrixFile {
        let [a, b] = task.responses();
        let (high, low) = if rng.chance(0.5) { (a, b) } else { (b, a) };
        ResponseMatrixFile {
            pre_reversal: Self::from_pairs(&[(StimulusClass::High, high), (StimulusClass::Low, low)]),
            post_reversal: Self::from_pairs(&[(StimulusClass::High, low), (StimulusClass::Low, high)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMatrixFile {
    pub pre_reversal: ResponseMatrix,
    pub post_reversal: ResponseMatrix,
}

impl ResponseMatrixFile {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reversal is not part of training; the pre-reversal map is always active.
    pub fn active(&self) -> &ResponseMatrix {
        &self.pre_reversal
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Pump calibration
// ─────────────────────────────────────────────────────────────────────────

/// Most recent calibration (`{ "<droid>": ms_per_ul }`) in `dir`.
///
/// Falls back to [`DEFAULT_MS_PER_UL`] with a warning when no file exists.
pub fn load_pump_calibration(dir: &Path) -> Result<f64> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    let Some(latest) = files.last() else {
        warn!(
            "no pump calibration data found in {}; using {DEFAULT_MS_PER_UL} ms per µl. Run a pump calibration to use correct values",
            dir.display()
        );
        return Ok(DEFAULT_MS_PER_UL);
    };
    let doc: serde_json::Map<String, serde_json::Value> = read_json(latest)?;
    doc.values()
        .next()
        .and_then(|v| v.as_f64())
        .filter(|v| *v > 0.0)
        .ok_or_else(|| invalid(latest, "expected one positive ms-per-µl value"))
}

/// Write a dated calibration file and return its path.
pub fn write_pump_calibration(
    dir: &Path,
    droid: &str,
    ms_per_ul: f64,
    date: chrono::NaiveDate,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_pump_calibration.json", date.format("%Y%m%d")));
    let mut doc = serde_json::Map::new();
    doc.insert(droid.to_string(), serde_json::json!(ms_per_ul));
    fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
    Ok(path)
}

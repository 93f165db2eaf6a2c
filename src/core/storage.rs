//! On-disk layout of rig settings and per-animal session data.
//!
//! ```text
//! <base>/droid_settings/droid_prefs.json
//! <base>/droid_settings/<task>_prefs.json
//! <base>/data/pump_calibration/<date>_pump_calibration.json
//! <base>/data/<animal>/<animal>_response_matrix.json
//! <base>/data/<animal>/<YYYYMMDD>/<HHMMSS>/<YYYYMMDD>_trial_data.csv
//!                                          ...._meta-data.json
//! ```
//!
//! Reading history never fails hard: an absent or unreadable file is a
//! fallback notice and `None`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::error::Result;
use crate::event_log::{read_trial_log, summarize_trials, OutcomeCounts, TrialSummary};
use crate::policy::{TaskKind, WheelSide};
use crate::reward::read_pump_log;

/// An animal directory with fewer entries than this has no training history.
pub const MIN_ENTRIES_FOR_TRAINING: usize = 3;

const SETTINGS_DIR: &str = "droid_settings";
const DATA_DIR: &str = "data";
const CALIBRATION_DIR: &str = "pump_calibration";
const METADATA_SUFFIX: &str = "_meta-data.json";

#[derive(Debug, Clone)]
pub struct RigLayout {
    base: PathBuf,
}

impl RigLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn rig_settings_path(&self) -> PathBuf {
        self.base.join(SETTINGS_DIR).join("droid_prefs.json")
    }

    pub fn task_prefs_path(&self, task: TaskKind) -> PathBuf {
        self.base
            .join(SETTINGS_DIR)
            .join(format!("{}_prefs.json", task.procedure()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join(DATA_DIR)
    }

    pub fn calibration_dir(&self) -> PathBuf {
        self.data_dir().join(CALIBRATION_DIR)
    }

    pub fn animal_dir(&self, animal: &str) -> PathBuf {
        self.data_dir().join(animal)
    }

    pub fn response_matrix_path(&self, animal: &str) -> PathBuf {
        self.animal_dir(animal)
            .join(format!("{animal}_response_matrix.json"))
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndingCriteria {
    #[default]
    Manual,
    MaxTime,
    LowTrialNum,
    Disengagement,
}

/// `bias_correction` is `false` when inactive and the side name otherwise.
mod bias_side {
    use super::*;

    pub fn serialize<S: Serializer>(side: &Option<WheelSide>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match side {
            Some(side) => side.serialize(s),
            None => s.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<WheelSide>, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        Ok(match value.as_str() {
            Some("left") => Some(WheelSide::Left),
            Some("right") => Some(WheelSide::Right),
            _ => None,
        })
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub animal_id: String,
    #[serde(default)]
    pub droid: String,
    #[serde(default)]
    pub experimenter: String,
    pub procedure: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    #[serde(rename = "2p_sync_record", default)]
    pub sync_record: bool,
    #[serde(default)]
    pub camera_data: bool,
    #[serde(rename = "# trials", default)]
    pub trials: u32,
    #[serde(default)]
    pub trial_statistics: OutcomeCounts,
    #[serde(default)]
    pub pump_duration: f64,
    #[serde(rename = "ITI_range", default)]
    pub iti_range: [f64; 2],
    #[serde(with = "bias_side", default)]
    pub bias_correction: Option<WheelSide>,
    #[serde(default = "yes")]
    pub pre_reversal: bool,
    #[serde(default)]
    pub ending_criteria: EndingCriteria,
    #[serde(default)]
    pub curr_stage: u8,
    #[serde(default)]
    pub stage_advance: bool,
    #[serde(default)]
    pub ready_for_experiment: bool,
}

impl SessionMetadata {
    /// Stage the next session starts at.
    pub fn next_stage(&self) -> u8 {
        self.curr_stage + self.stage_advance as u8
    }
}

/// A completed session read back from disk.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    pub dir: SessionDir,
    pub metadata: SessionMetadata,
    pub trials: Vec<TrialSummary>,
}

// ─────────────────────────────────────────────────────────────────────────
// Session directory
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDir {
    path: PathBuf,
    date: String,
}

impl SessionDir {
    /// `path` is `<animal>/<YYYYMMDD>/<HHMMSS>`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let date = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, date }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.path.join(format!("{}_{suffix}", self.date))
    }

    pub fn trial_log_path(&self) -> PathBuf {
        self.file("trial_data.csv")
    }

    pub fn pump_log_path(&self) -> PathBuf {
        self.file("pump_data.csv")
    }

    pub fn rotary_log_path(&self) -> PathBuf {
        self.file("rotary_data.csv")
    }

    pub fn tone_cloud_log_path(&self) -> PathBuf {
        self.file("tone_cloud_data.csv")
    }

    pub fn camera_log_path(&self) -> PathBuf {
        self.file("camera_pulse_data.csv")
    }

    pub fn sync_log_path(&self) -> PathBuf {
        self.file("sync_pulse_data.csv")
    }

    pub fn metadata_path(&self, animal: &str) -> PathBuf {
        self.file(&format!("{animal}{METADATA_SUFFIX}"))
    }

    pub fn prefs_snapshot_path(&self) -> PathBuf {
        self.path.join("droid_and_task_prefs.json")
    }

    pub fn read_metadata(&self) -> Option<SessionMetadata> {
        let entries = fs::read_dir(&self.path).ok()?;
        let file = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .find(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(METADATA_SUFFIX))
            })?;
        let text = fs::read_to_string(&file).ok()?;
        match serde_json::from_str(&text) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("unreadable metadata {}: {e}", file.display());
                None
            }
        }
    }

    pub fn write_metadata(&self, meta: &SessionMetadata) -> Result<PathBuf> {
        let path = self.metadata_path(&meta.animal_id);
        fs::write(&path, serde_json::to_string_pretty(meta)?)?;
        Ok(path)
    }

    /// Copy the rig and task preference documents into the session.
    pub fn write_prefs_snapshot(&self, layout: &RigLayout, task: TaskKind) -> Result<PathBuf> {
        let read = |p: PathBuf| -> Result<serde_json::Value> {
            Ok(serde_json::from_str(&fs::read_to_string(p)?)?)
        };
        let doc = serde_json::json!({
            "droid_prefs": read(layout.rig_settings_path())?,
            "task_prefs": read(layout.task_prefs_path(task))?,
        });
        let path = self.prefs_snapshot_path();
        fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
        Ok(path)
    }

    /// Completed trials, or empty when the log is missing or unreadable.
    pub fn read_trials(&self) -> Vec<TrialSummary> {
        let path = self.trial_log_path();
        if !path.exists() {
            return Vec::new();
        }
        match read_trial_log(&path) {
            Ok(records) => summarize_trials(&records),
            Err(e) => {
                warn!("unreadable trial log {}: {e}", path.display());
                Vec::new()
            }
        }
    }

    pub fn read_pump_durations(&self) -> Vec<f64> {
        let path = self.pump_log_path();
        if !path.exists() {
            return Vec::new();
        }
        match read_pump_log(&path) {
            Ok(rows) => rows.iter().map(|r| r.pump_duration as f64).collect(),
            Err(e) => {
                warn!("unreadable pump log {}: {e}", path.display());
                Vec::new()
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Animal store
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnimalStore {
    animal: String,
    dir: PathBuf,
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    out.sort();
    out
}

impl AnimalStore {
    pub fn open(layout: &RigLayout, animal: &str) -> Result<Self> {
        let dir = layout.animal_dir(animal);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            animal: animal.to_string(),
            dir,
        })
    }

    pub fn animal(&self) -> &str {
        &self.animal
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every session directory, oldest first.
    pub fn sessions(&self) -> Vec<SessionDir> {
        sorted_subdirs(&self.dir)
            .iter()
            .flat_map(|day| sorted_subdirs(day))
            .map(SessionDir::from_path)
            .collect()
    }

    /// Latest session of each day, oldest day first, skipping `exclude`.
    fn daily_sessions(&self, exclude: Option<&Path>) -> Vec<SessionDir> {
        sorted_subdirs(&self.dir)
            .iter()
            .filter_map(|day| {
                sorted_subdirs(day)
                    .into_iter()
                    .filter(|s| Some(s.as_path()) != exclude)
                    .last()
            })
            .map(SessionDir::from_path)
            .collect()
    }

    /// Metadata of the most recent session; the day before is tried when the
    /// latest session has none.
    pub fn latest_metadata(&self, exclude: Option<&Path>) -> Option<SessionMetadata> {
        let days = self.daily_sessions(exclude);
        let mut recent = days.iter().rev();
        let last = recent.next()?;
        if let Some(meta) = last.read_metadata() {
            return Some(meta);
        }
        warn!(
            "no metadata file found for {}, trying the previous day",
            last.path().display()
        );
        let meta = recent.next().and_then(|s| s.read_metadata());
        if meta.is_none() {
            warn!("no metadata on two successive days, using defaults");
        }
        meta
    }

    /// First training day: too little history, missing metadata, or the
    /// previous procedure was habituation.
    pub fn is_first_day(&self) -> bool {
        let entries = fs::read_dir(&self.dir).map(|e| e.count()).unwrap_or(0);
        if entries < MIN_ENTRIES_FOR_TRAINING {
            info!("no habituation data or insufficient data found, treating as first day");
            return true;
        }
        match self.latest_metadata(None) {
            Some(meta) => meta.procedure.starts_with("habituation"),
            None => {
                warn!("missing or corrupt metadata, treating as first day");
                true
            }
        }
    }

    /// The latest session of each of the `n` most recent days, oldest first.
    pub fn recent_sessions(&self, n: usize, exclude: Option<&Path>) -> Vec<SessionDir> {
        let days = self.daily_sessions(exclude);
        let skip = days.len().saturating_sub(n);
        days.into_iter().skip(skip).collect()
    }

    /// All sessions of the most recent day.
    pub fn last_day_sessions(&self, exclude: Option<&Path>) -> Vec<SessionDir> {
        let Some(day) = sorted_subdirs(&self.dir)
            .into_iter()
            .rev()
            .find(|day| sorted_subdirs(day).iter().any(|s| Some(s.as_path()) != exclude))
        else {
            return Vec::new();
        };
        sorted_subdirs(&day)
            .into_iter()
            .filter(|s| Some(s.as_path()) != exclude)
            .map(SessionDir::from_path)
            .collect()
    }

    pub fn load_history(&self, dir: &SessionDir) -> Option<SessionHistory> {
        let metadata = dir.read_metadata()?;
        Some(SessionHistory {
            dir: dir.clone(),
            metadata,
            trials: dir.read_trials(),
        })
    }

    /// Create `<animal>/<YYYYMMDD>/<HHMMSS>` for a session starting at `now`.
    pub fn create_session(&self, now: DateTime<Local>) -> Result<SessionDir> {
        let path = self
            .dir
            .join(now.format("%Y%m%d").to_string())
            .join(now.format("%H%M%S").to_string());
        fs::create_dir_all(&path)?;
        Ok(SessionDir::from_path(path))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn metadata(animal: &str, stage: u8, advance: bool) -> SessionMetadata {
        SessionMetadata {
            animal_id: animal.into(),
            droid: "droid1".into(),
            experimenter: "tester".into(),
            procedure: "auditory_2afc".into(),
            date: String::new(),
            start: String::new(),
            end: String::new(),
            sync_record: false,
            camera_data: false,
            trials: 0,
            trial_statistics: OutcomeCounts::default(),
            pump_duration: 100.0,
            iti_range: [1.0, 3.0],
            bias_correction: None,
            pre_reversal: true,
            ending_criteria: EndingCriteria::Manual,
            curr_stage: stage,
            stage_advance: advance,
            ready_for_experiment: false,
        }
    }

    pub(crate) fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 5, day, hour, 0, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn metadata_keeps_original_key_names() {
        let mut meta = metadata("m1", 2, true);
        meta.trials = 12;
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["# trials"], 12);
        assert_eq!(v["bias_correction"], false);
        assert_eq!(v["ending_criteria"], "manual");
        assert_eq!(v["trial_statistics"], serde_json::json!([0, 0, 0]));

        meta.bias_correction = Some(WheelSide::Left);
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["bias_correction"], "left");
        let back: SessionMetadata = serde_json::from_value(v).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.next_stage(), 3);
    }

    #[test]
    fn sparse_metadata_uses_defaults() {
        let meta: SessionMetadata = serde_json::from_str(
            r#"{"animal_id": "m1", "procedure": "habituation_auditory_tasks", "habi_day": 2}"#,
        )
        .unwrap();
        assert_eq!(meta.curr_stage, 0);
        assert!(meta.pre_reversal);
        assert_eq!(meta.bias_correction, None);
    }

    #[test]
    fn first_day_detection() {
        let root = tempfile::tempdir().unwrap();
        let layout = RigLayout::new(root.path());
        let store = AnimalStore::open(&layout, "m1").unwrap();
        assert!(store.is_first_day());

        for day in 1..=3 {
            let s = store.create_session(at(day, 9)).unwrap();
            let mut meta = metadata("m1", 0, false);
            if day == 3 {
                meta.procedure = "habituation_auditory_tasks".into();
            }
            s.write_metadata(&meta).unwrap();
        }
        assert!(store.is_first_day());

        let s = store.create_session(at(4, 9)).unwrap();
        s.write_metadata(&metadata("m1", 1, false)).unwrap();
        assert!(!store.is_first_day());
    }

    #[test]
    fn metadata_falls_back_to_previous_day() {
        let root = tempfile::tempdir().unwrap();
        let store = AnimalStore::open(&RigLayout::new(root.path()), "m1").unwrap();
        store
            .create_session(at(1, 9))
            .unwrap()
            .write_metadata(&metadata("m1", 2, true))
            .unwrap();
        store.create_session(at(2, 9)).unwrap();

        assert_eq!(store.latest_metadata(None).unwrap().next_stage(), 3);

        store.create_session(at(3, 9)).unwrap();
        assert!(store.latest_metadata(None).is_none());
    }

    #[test]
    fn recent_sessions_take_latest_per_day_and_skip_current() {
        let root = tempfile::tempdir().unwrap();
        let store = AnimalStore::open(&RigLayout::new(root.path()), "m1").unwrap();
        store.create_session(at(1, 9)).unwrap();
        let late = store.create_session(at(1, 15)).unwrap();
        let d2 = store.create_session(at(2, 9)).unwrap();
        let d3 = store.create_session(at(3, 9)).unwrap();
        let current = store.create_session(at(4, 9)).unwrap();

        let recent = store.recent_sessions(3, Some(current.path()));
        assert_eq!(recent, vec![late, d2, d3.clone()]);

        let last = store.last_day_sessions(Some(current.path()));
        assert_eq!(last, vec![d3]);
        assert_eq!(store.sessions().len(), 5);
    }

    #[test]
    fn session_file_names_are_date_keyed() {
        let s = SessionDir::from_path("/x/m1/20240501/090000");
        assert_eq!(s.date(), "20240501");
        assert_eq!(
            s.trial_log_path(),
            PathBuf::from("/x/m1/20240501/090000/20240501_trial_data.csv")
        );
        assert_eq!(
            s.metadata_path("m1"),
            PathBuf::from("/x/m1/20240501/090000/20240501_m1_meta-data.json")
        );
    }
}

//! Error types for the rig.
//!
//! Configuration problems are fatal and surface here. Missing history is not an
//! error anywhere in the crate: loaders fall back to first-day defaults instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A required preference document does not exist.
    #[error("configuration file {0:?} not found; no trial logic can run without it")]
    MissingConfig(PathBuf),

    /// A preference document exists but cannot be used.
    #[error("invalid configuration in {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("response matrix: {0}")]
    ResponseMatrix(String),

    #[error("stage evaluation: {0}")]
    Stage(String),

    #[error("stimulus generation failed: {0}")]
    Stimulus(String),

    #[error("audio output failed: {0}")]
    Audio(String),

    /// A trial event arrived out of phase order.
    #[error("trial log order violated: {0}")]
    EventOrder(String),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

//! Cross-platform application paths

use std::fs;
use std::path::PathBuf;

use wheelrig::storage::RigLayout;

/// Overrides the data directory when set.
pub const HOME_ENV: &str = "WHEELRIG_HOME";

#[derive(Debug, Clone)]
pub struct AppPaths {
    base: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, String> {
        let base = Self::get_base_dir()?;

        // Ensure directory exists
        fs::create_dir_all(&base).map_err(|e| format!("Failed to create data directory: {}", e))?;

        Ok(Self { base })
    }

    fn get_base_dir() -> Result<PathBuf, String> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        let base = dirs::data_dir().ok_or("Could not determine data directory")?;
        Ok(base.join("wheelrig"))
    }

    pub fn base(&self) -> &PathBuf {
        &self.base
    }

    pub fn layout(&self) -> RigLayout {
        RigLayout::new(&self.base)
    }
}

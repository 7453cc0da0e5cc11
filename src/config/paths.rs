//! Default on-disk locations.

use crate::error::SorterError;
use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Result<ProjectDirs, SorterError> {
    ProjectDirs::from("", "kmsorter", "kmsorter").ok_or_else(|| {
        SorterError::ConfigError(
            "Could not determine platform directories (HOME not set)".to_string(),
        )
    })
}

/// `$XDG_CONFIG_HOME/kmsorter/config.toml` or the platform equivalent.
pub fn config_file() -> Option<PathBuf> {
    project_dirs()
        .ok()
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Default spool directory shared by agents on this machine.
pub fn default_spool_dir() -> Result<PathBuf, SorterError> {
    Ok(project_dirs()?.data_dir().join("bus"))
}

/// Default dedup index location.
pub fn default_store_path() -> Result<PathBuf, SorterError> {
    Ok(project_dirs()?.data_dir().join("index"))
}

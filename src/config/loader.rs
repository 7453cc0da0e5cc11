//! Config file and environment merging.

use super::{paths, SorterConfig};
use crate::error::SorterError;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "KMSORTER";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from the platform config file (if present) and the environment.
    pub fn load() -> Result<SorterConfig, SorterError> {
        let builder = Config::builder();
        let builder = match paths::config_file() {
            Some(path) => builder.add_source(File::from(path).format(FileFormat::Toml).required(false)),
            None => builder,
        };
        Self::finish(builder)
    }

    /// Load from `path`, which must exist, plus the environment.
    pub fn load_from_file(path: &Path) -> Result<SorterConfig, SorterError> {
        if !path.is_file() {
            return Err(SorterError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let builder = Config::builder()
            .add_source(File::from(PathBuf::from(path)).format(FileFormat::Toml));
        Self::finish(builder)
    }

    /// `--config` when given, otherwise the platform file.
    pub fn load_with_override(path: Option<&Path>) -> Result<SorterConfig, SorterError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load(),
        }
    }

    /// Parse a TOML document without consulting files or the environment.
    pub fn from_toml(text: &str) -> Result<SorterConfig, SorterError> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<SorterConfig, SorterError> {
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

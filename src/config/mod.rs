//! Configuration
//!
//! [`SorterConfig`] is assembled by [`ConfigLoader`] from compiled-in defaults, an
//! optional TOML file and `KMSORTER__SECTION__KEY` environment variables. Every
//! field has a default, so an empty configuration is valid.

pub mod loader;
pub mod paths;

use crate::dedup::DedupScope;
use crate::ingest::IngestConfig;
use crate::logging::LoggingConfig;
use crate::process::ProcessConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use loader::ConfigLoader;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SorterConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Message bus settings (`[bus]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Spool directory shared by all agents; platform data dir `bus/` when unset
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Chunk messages from loaders
    #[serde(default = "default_load_channel")]
    pub load_channel: String,
    /// Color signatures from processors
    #[serde(default = "default_process_channel")]
    pub process_channel: String,
    /// Classification results
    #[serde(default = "default_sort_channel")]
    pub sort_channel: String,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_load_channel() -> String {
    "kmsorter.load".to_string()
}

fn default_process_channel() -> String {
    "kmsorter.processed".to_string()
}

fn default_sort_channel() -> String {
    "kmsorter.sorted".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            load_channel: default_load_channel(),
            process_channel: default_process_channel(),
            sort_channel: default_sort_channel(),
        }
    }
}

/// Dedup index settings (`[store]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sled database directory; platform data dir `index/` when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub dedup_scope: DedupScope,
}

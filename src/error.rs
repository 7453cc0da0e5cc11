//! Error types for the sorter pipelines.
//!
//! Three layers: [`StorageError`] for the dedup index store, [`BusError`] for the
//! message transport, and [`SorterError`] for everything a pipeline reports.

use crate::types::LogicalIdentity;
use std::path::PathBuf;
use thiserror::Error;

/// Dedup index store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corrupt index record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Transaction conflict on key {0}")]
    Conflict(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict(_)
                | StorageError::IoError(_)
                | StorageError::Database(sled::Error::Io(_))
        )
    }
}

/// Message bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("Bus IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription closed for channel {0}")]
    Closed(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Io(_) | BusError::Unreachable(_))
    }
}

/// Pipeline-level errors.
#[derive(Debug, Error)]
pub enum SorterError {
    /// Bus or store unreachable at startup.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Chunk count mismatch for {identity}: buffer expects {expected}, chunk reports {actual}")]
    ChunkCountMismatch {
        identity: LogicalIdentity,
        expected: usize,
        actual: usize,
    },

    /// Same bytes were already ingested; `host` is the host that stored them first.
    #[error("Same image was processed by agent on host {host} (as {existing})")]
    DuplicateArtifact {
        host: String,
        existing: LogicalIdentity,
    },

    #[error("Publish failed after {attempts} attempt(s): {source}")]
    PublishFailure {
        attempts: usize,
        #[source]
        source: BusError,
    },

    #[error("Store operation failed after {attempts} attempt(s): {source}")]
    StoreFailure {
        attempts: usize,
        #[source]
        source: StorageError,
    },

    #[error("Stalled transfer for {identity}: {received}/{total} chunk(s) after {idle_ms}ms idle")]
    StalledTransfer {
        identity: LogicalIdentity,
        received: usize,
        total: usize,
        idle_ms: u128,
    },

    #[error("Image error: {0}")]
    Image(String),

    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl SorterError {
    /// Duplicates are an expected outcome of dedup resolution, not a fault.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SorterError::DuplicateArtifact { .. })
    }

    /// Errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SorterError::Storage(e) => e.is_transient(),
            SorterError::Bus(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for SorterError {
    fn from(err: tokio::task::JoinError) -> Self {
        SorterError::TaskFailed(err.to_string())
    }
}

impl From<config::ConfigError> for SorterError {
    fn from(err: config::ConfigError) -> Self {
        SorterError::ConfigError(err.to_string())
    }
}

impl From<image::ImageError> for SorterError {
    fn from(err: image::ImageError) -> Self {
        SorterError::Image(err.to_string())
    }
}

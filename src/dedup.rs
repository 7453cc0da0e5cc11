//! Dedup Coordinator
//!
//! Decides whether a newly observed artifact is a true duplicate, a same-named file
//! with new content that needs its own identity, or a first sighting.
//!
//! The dedup key is the (NFC-normalized) file name. Every host that ever sent a file
//! under that name appends its `(identity, digest)` pair to the key's entry list, so
//! a lookup sees all hosts' variants at once. Resolution runs under the per-key lock
//! of [`KeyLockManager`] and inside one [`DedupIndex::apply`] call, which the store
//! executes atomically.

use crate::concurrency::KeyLockManager;
use crate::error::{SorterError, StorageError};
use crate::retry::RetryPolicy;
use crate::store::{Decision, DedupIndex, IndexRecord, IndexView};
use crate::types::{ContentDigest, LogicalIdentity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

/// Which earlier content counts as a duplicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Identical bytes anywhere in the index, under any host or name.
    #[default]
    Global,
    /// Identical bytes under the same file name, from any host.
    Name,
}

/// Dedup key for a file name.
pub fn dedup_key(name: &str) -> String {
    name.nfc().collect()
}

/// Split a file name into stem and extension at the last dot.
///
/// Leading-dot names (`.hidden`) have no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

/// `photo.png` with suffix 2 becomes `photo_2.png`.
pub fn suffixed_name(name: &str, k: usize) -> String {
    match split_extension(name) {
        (stem, Some(ext)) => format!("{}_{}.{}", stem, k, ext),
        (stem, None) => format!("{}_{}", stem, k),
    }
}

/// Resolves `(host, name, digest)` into a unique identity.
pub struct DedupCoordinator {
    index: Arc<dyn DedupIndex>,
    locks: KeyLockManager,
    scope: DedupScope,
    retry: RetryPolicy,
}

impl DedupCoordinator {
    pub fn new(index: Arc<dyn DedupIndex>, scope: DedupScope, retry: RetryPolicy) -> Self {
        Self {
            index,
            locks: KeyLockManager::new(),
            scope,
            retry,
        }
    }

    pub fn index(&self) -> &Arc<dyn DedupIndex> {
        &self.index
    }

    pub fn scope(&self) -> DedupScope {
        self.scope
    }

    /// Resolve an artifact to its identity.
    ///
    /// Fails with [`SorterError::DuplicateArtifact`] when the digest is already
    /// known, citing the host that stored it first. Store failures are retried per
    /// the policy and then surfaced as [`SorterError::StoreFailure`].
    pub fn resolve(
        &self,
        host: &str,
        name: &str,
        digest: ContentDigest,
    ) -> Result<LogicalIdentity, SorterError> {
        let name = dedup_key(name);
        let base = LogicalIdentity::new(host, &name).ok_or_else(|| SorterError::InvalidPath {
            path: PathBuf::from(&name),
            reason: format!("cannot form an identity from host '{}' and this name", host),
        })?;

        let decision = self
            .retry
            .run_blocking("dedup_resolve", StorageError::is_transient, || {
                self.locks.with_lock(&name, || {
                    self.index.apply(&name, &|view| {
                        decide(view, self.scope, &name, &base, digest)
                    })
                })
            })
            .map_err(|exhausted| SorterError::StoreFailure {
                attempts: exhausted.attempts,
                source: exhausted.last_error,
            })?;

        match decision {
            Decision::Append(record) => {
                info!(
                    identity = %record.identity,
                    digest = %record.digest,
                    "Assigned identity"
                );
                Ok(record.identity)
            }
            Decision::Reject(existing) => {
                debug!(
                    existing = %existing.identity,
                    host,
                    name = %name,
                    "Content already indexed"
                );
                Err(SorterError::DuplicateArtifact {
                    host: existing.identity.host().to_string(),
                    existing: existing.identity,
                })
            }
        }
    }
}

fn decide(
    view: &dyn IndexView,
    scope: DedupScope,
    key: &str,
    base: &LogicalIdentity,
    digest: ContentDigest,
) -> Result<Decision, StorageError> {
    let records = view.entries(key)?;

    if let Some(existing) = records.iter().find(|r| r.digest == digest) {
        return Ok(Decision::Reject(existing.clone()));
    }
    if scope == DedupScope::Global {
        if let Some(identity) = view.identity_for(&digest)? {
            return Ok(Decision::Reject(IndexRecord { identity, digest }));
        }
    }

    let same_host = records.iter().any(|r| r.identity.host() == base.host());
    let base_taken = view.digest_of(base)?.is_some();

    let identity = if same_host || base_taken {
        let mut k = 0usize;
        loop {
            let candidate = LogicalIdentity::new(base.host(), &suffixed_name(base.name(), k))
                .ok_or_else(|| StorageError::Corrupt {
                    key: key.to_string(),
                    reason: "suffixed identity is invalid".to_string(),
                })?;
            if view.digest_of(&candidate)?.is_none() {
                break candidate;
            }
            k += 1;
        }
    } else {
        base.clone()
    };

    Ok(Decision::Append(IndexRecord { identity, digest }))
}

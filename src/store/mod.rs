//! Dedup Index Store
//!
//! Append-only record of every distinct content stream seen under a dedup key,
//! plus two direct mappings used for O(1) lookups:
//!
//! - `identity -> digest`
//! - `digest -> first identity that carried it`
//!
//! Resolution is a read-decide-append sequence. Implementations run it as one
//! atomic unit through [`DedupIndex::apply`], so two concurrent resolutions for the
//! same key can never both append on the same snapshot.

pub mod memory;
pub mod persistence;

use crate::error::StorageError;
use crate::types::{ContentDigest, LogicalIdentity};
use serde::{Deserialize, Serialize};

pub use memory::MemoryDedupIndex;
pub use persistence::SledDedupIndex;

/// One `(identity, digest)` pair of a dedup index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub identity: LogicalIdentity,
    pub digest: ContentDigest,
}

/// Read access to the index from inside an atomic section.
pub trait IndexView {
    /// All records under `key`, oldest first.
    fn entries(&self, key: &str) -> Result<Vec<IndexRecord>, StorageError>;

    fn digest_of(&self, identity: &LogicalIdentity)
        -> Result<Option<ContentDigest>, StorageError>;

    /// First identity ever stored with `digest`, if any.
    fn identity_for(&self, digest: &ContentDigest)
        -> Result<Option<LogicalIdentity>, StorageError>;
}

/// What a resolution step decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Append this record under the key.
    Append(IndexRecord),
    /// Leave the index untouched; the record is the existing match.
    Reject(IndexRecord),
}

/// Shared dedup index.
pub trait DedupIndex: Send + Sync {
    /// Atomically evaluate `decide` against the current state and apply its
    /// [`Decision::Append`] under `key`.
    fn apply(
        &self,
        key: &str,
        decide: &dyn Fn(&dyn IndexView) -> Result<Decision, StorageError>,
    ) -> Result<Decision, StorageError>;

    /// Snapshot of the records under `key`.
    fn entries(&self, key: &str) -> Result<Vec<IndexRecord>, StorageError>;

    fn digest_of(&self, identity: &LogicalIdentity)
        -> Result<Option<ContentDigest>, StorageError>;

    /// Number of dedup keys present.
    fn key_count(&self) -> Result<usize, StorageError>;

    /// Make appended records durable.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

//! In-process dedup index. Atomicity comes from a single mutex over all maps.

use super::{Decision, DedupIndex, IndexRecord, IndexView};
use crate::error::StorageError;
use crate::types::{ContentDigest, LogicalIdentity};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Vec<IndexRecord>>,
    identities: HashMap<LogicalIdentity, ContentDigest>,
    contents: HashMap<ContentDigest, LogicalIdentity>,
}

impl IndexView for MemoryState {
    fn entries(&self, key: &str) -> Result<Vec<IndexRecord>, StorageError> {
        Ok(self.entries.get(key).cloned().unwrap_or_default())
    }

    fn digest_of(
        &self,
        identity: &LogicalIdentity,
    ) -> Result<Option<ContentDigest>, StorageError> {
        Ok(self.identities.get(identity).copied())
    }

    fn identity_for(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<LogicalIdentity>, StorageError> {
        Ok(self.contents.get(digest).cloned())
    }
}

#[derive(Default)]
pub struct MemoryDedupIndex {
    state: Mutex<MemoryState>,
}

impl MemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupIndex for MemoryDedupIndex {
    fn apply(
        &self,
        key: &str,
        decide: &dyn Fn(&dyn IndexView) -> Result<Decision, StorageError>,
    ) -> Result<Decision, StorageError> {
        let mut state = self.state.lock();
        let decision = decide(&*state)?;
        if let Decision::Append(record) = &decision {
            state
                .entries
                .entry(key.to_string())
                .or_default()
                .push(record.clone());
            state
                .identities
                .insert(record.identity.clone(), record.digest);
            state
                .contents
                .entry(record.digest)
                .or_insert_with(|| record.identity.clone());
        }
        Ok(decision)
    }

    fn entries(&self, key: &str) -> Result<Vec<IndexRecord>, StorageError> {
        self.state.lock().entries(key)
    }

    fn digest_of(
        &self,
        identity: &LogicalIdentity,
    ) -> Result<Option<ContentDigest>, StorageError> {
        self.state.lock().digest_of(identity)
    }

    fn key_count(&self) -> Result<usize, StorageError> {
        Ok(self.state.lock().entries.len())
    }
}

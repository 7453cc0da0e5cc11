//! Sled-backed dedup index.
//!
//! Three trees:
//!
//! - `entries`: dedup key -> bincode `Vec<IndexRecord>`
//! - `identities`: identity -> 32-byte digest
//! - `contents`: 32-byte digest -> identity
//!
//! [`DedupIndex::apply`] runs inside a serializable multi-tree transaction, which is
//! the compare-and-update the resolution needs: a conflicting concurrent writer
//! makes the transaction fail with [`StorageError::Conflict`] instead of both
//! appending on the same snapshot.
//!
//! sled locks its database exclusively, so the index is only opened for the length
//! of one operation. Loader agents in other processes take turns on the same store;
//! opening while another agent holds the lock is retried under the index's
//! [`RetryPolicy`].

use super::{Decision, DedupIndex, IndexRecord, IndexView};
use crate::error::StorageError;
use crate::retry::RetryPolicy;
use crate::types::{ContentDigest, LogicalIdentity};
use parking_lot::Mutex;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
    UnabortableTransactionError,
};
use sled::{Db, Transactional, Tree};
use std::path::{Path, PathBuf};
use tracing::debug;

const ENTRIES_TREE: &str = "entries";
const IDENTITIES_TREE: &str = "identities";
const CONTENTS_TREE: &str = "contents";

/// Trees of one open database handle.
struct OpenIndex {
    db: Db,
    entries: Tree,
    identities: Tree,
    contents: Tree,
}

impl OpenIndex {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(None)
            .open()?;
        Ok(Self {
            entries: db.open_tree(ENTRIES_TREE)?,
            identities: db.open_tree(IDENTITIES_TREE)?,
            contents: db.open_tree(CONTENTS_TREE)?,
            db,
        })
    }
}

pub struct SledDedupIndex {
    path: PathBuf,
    retry: RetryPolicy,
    // One open handle per process at a time; sled's file lock is not reentrant.
    gate: Mutex<()>,
}

impl SledDedupIndex {
    /// Open (or create) the index database at `path` with the default retry
    /// policy for lock contention.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::open_with_retry(path, RetryPolicy::default())
    }

    /// Open (or create) the index at `path`. The database is opened once here so
    /// an unusable store fails at startup.
    pub fn open_with_retry(path: &Path, retry: RetryPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)?;
        let index = Self {
            path: path.to_path_buf(),
            retry,
            gate: Mutex::new(()),
        };
        index.with_open(|_| Ok(()))?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against a freshly opened database and close it again.
    fn with_open<T>(
        &self,
        op: impl FnOnce(&OpenIndex) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let _gate = self.gate.lock();
        let open = self
            .retry
            .run_blocking("index_open", StorageError::is_transient, || {
                OpenIndex::open(&self.path)
            })
            .map_err(|exhausted| exhausted.last_error)?;
        let result = op(&open);
        drop(open);
        debug!(store = %self.path.display(), "Closed dedup index");
        result
    }
}

fn decode_records(key: &str, raw: &[u8]) -> Result<Vec<IndexRecord>, StorageError> {
    bincode::deserialize(raw).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_digest(key: &str, raw: &[u8]) -> Result<ContentDigest, StorageError> {
    let bytes: [u8; 32] = raw.try_into().map_err(|_| StorageError::Corrupt {
        key: key.to_string(),
        reason: format!("digest has {} bytes, expected 32", raw.len()),
    })?;
    Ok(ContentDigest::from_bytes(bytes))
}

fn decode_identity(key: &str, raw: &[u8]) -> Result<LogicalIdentity, StorageError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(LogicalIdentity::parse)
        .ok_or_else(|| StorageError::Corrupt {
            key: key.to_string(),
            reason: "stored identity is not a valid host:name".to_string(),
        })
}

fn tx_error(key: &str, err: UnabortableTransactionError) -> StorageError {
    match err {
        UnabortableTransactionError::Conflict => StorageError::Conflict(key.to_string()),
        UnabortableTransactionError::Storage(e) => StorageError::Database(e),
    }
}

/// View over the transactional trees.
struct TxView<'a> {
    entries: &'a TransactionalTree,
    identities: &'a TransactionalTree,
    contents: &'a TransactionalTree,
}

impl IndexView for TxView<'_> {
    fn entries(&self, key: &str) -> Result<Vec<IndexRecord>, StorageError> {
        match self.entries.get(key.as_bytes()).map_err(|e| tx_error(key, e))? {
            Some(raw) => decode_records(key, &raw),
            None => Ok(Vec::new()),
        }
    }

    fn digest_of(
        &self,
        identity: &LogicalIdentity,
    ) -> Result<Option<ContentDigest>, StorageError> {
        let key = identity.as_str();
        self.identities
            .get(key.as_bytes())
            .map_err(|e| tx_error(key, e))?
            .map(|raw| decode_digest(key, &raw))
            .transpose()
    }

    fn identity_for(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<LogicalIdentity>, StorageError> {
        let key = digest.to_hex();
        self.contents
            .get(&digest.as_bytes()[..])
            .map_err(|e| tx_error(&key, e))?
            .map(|raw| decode_identity(&key, &raw))
            .transpose()
    }
}

impl DedupIndex for SledDedupIndex {
    fn apply(
        &self,
        key: &str,
        decide: &dyn Fn(&dyn IndexView) -> Result<Decision, StorageError>,
    ) -> Result<Decision, StorageError> {
        self.with_open(|open| {
            let result = (&open.entries, &open.identities, &open.contents).transaction(
                |(entries, identities, contents)| {
                    let view = TxView {
                        entries,
                        identities,
                        contents,
                    };
                    let decision = decide(&view).map_err(ConflictableTransactionError::Abort)?;

                    if let Decision::Append(record) = &decision {
                        let mut records = view
                            .entries(key)
                            .map_err(ConflictableTransactionError::Abort)?;
                        records.push(record.clone());
                        let encoded = bincode::serialize(&records)
                            .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

                        entries.insert(key.as_bytes(), encoded)?;
                        identities.insert(
                            record.identity.as_str().as_bytes(),
                            &record.digest.as_bytes()[..],
                        )?;
                        if contents.get(&record.digest.as_bytes()[..])?.is_none() {
                            contents.insert(
                                &record.digest.as_bytes()[..],
                                record.identity.as_str().as_bytes(),
                            )?;
                        }
                    }
                    Ok(decision)
                },
            );

            let decision = match result {
                Ok(decision) => decision,
                Err(TransactionError::Abort(e)) => return Err(e),
                Err(TransactionError::Storage(e)) => return Err(StorageError::Database(e)),
            };
            if matches!(decision, Decision::Append(_)) {
                open.db.flush()?;
            }
            Ok(decision)
        })
    }

    fn entries(&self, key: &str) -> Result<Vec<IndexRecord>, StorageError> {
        self.with_open(|open| match open.entries.get(key.as_bytes())? {
            Some(raw) => decode_records(key, &raw),
            None => Ok(Vec::new()),
        })
    }

    fn digest_of(
        &self,
        identity: &LogicalIdentity,
    ) -> Result<Option<ContentDigest>, StorageError> {
        let key = identity.as_str();
        self.with_open(|open| {
            open.identities
                .get(key.as_bytes())?
                .map(|raw| decode_digest(key, &raw))
                .transpose()
        })
    }

    fn key_count(&self) -> Result<usize, StorageError> {
        self.with_open(|open| Ok(open.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(host: &str, name: &str, content: &[u8]) -> IndexRecord {
        IndexRecord {
            identity: LogicalIdentity::new(host, name).unwrap(),
            digest: ContentDigest::of(content),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let temp = TempDir::new().unwrap();
        let index = SledDedupIndex::open(&temp.path().join("index")).unwrap();
        let rec = record("hostA", "a.png", b"one");

        let decision = index
            .apply("a.png", &|view| {
                assert!(view.entries("a.png")?.is_empty());
                Ok(Decision::Append(rec.clone()))
            })
            .unwrap();
        assert_eq!(decision, Decision::Append(rec.clone()));

        assert_eq!(index.entries("a.png").unwrap(), vec![rec.clone()]);
        assert_eq!(index.digest_of(&rec.identity).unwrap(), Some(rec.digest));
        assert_eq!(index.key_count().unwrap(), 1);
    }

    #[test]
    fn test_reject_leaves_index_untouched() {
        let temp = TempDir::new().unwrap();
        let index = SledDedupIndex::open(temp.path()).unwrap();
        let rec = record("hostA", "a.png", b"one");

        index
            .apply("a.png", &|_| Ok(Decision::Reject(rec.clone())))
            .unwrap();
        assert!(index.entries("a.png").unwrap().is_empty());
        assert_eq!(index.key_count().unwrap(), 0);
    }

    #[test]
    fn test_first_identity_wins_content_mapping() {
        let temp = TempDir::new().unwrap();
        let index = SledDedupIndex::open(temp.path()).unwrap();
        let first = record("hostA", "a.png", b"same");
        let second = record("hostB", "b.png", b"same");

        index
            .apply("a.png", &|_| Ok(Decision::Append(first.clone())))
            .unwrap();
        index
            .apply("b.png", &|_| Ok(Decision::Append(second.clone())))
            .unwrap();

        index
            .apply("c.png", &|view| {
                assert_eq!(
                    view.identity_for(&first.digest)?,
                    Some(first.identity.clone())
                );
                Ok(Decision::Reject(first.clone()))
            })
            .unwrap();
    }

    #[test]
    fn test_abort_propagates_error() {
        let temp = TempDir::new().unwrap();
        let index = SledDedupIndex::open(temp.path()).unwrap();
        let err = index
            .apply("a.png", &|_| Err(StorageError::Conflict("a.png".to_string())))
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_two_handles_on_one_store() {
        let temp = TempDir::new().unwrap();
        let first = SledDedupIndex::open(temp.path()).unwrap();
        let second = SledDedupIndex::open(temp.path()).unwrap();
        let rec = record("hostA", "a.png", b"shared");

        first
            .apply("a.png", &|_| Ok(Decision::Append(rec.clone())))
            .unwrap();
        assert_eq!(second.entries("a.png").unwrap(), vec![rec.clone()]);
        assert_eq!(second.digest_of(&rec.identity).unwrap(), Some(rec.digest));
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let rec = record("hostA", "a.png", b"persist");
        {
            let index = SledDedupIndex::open(temp.path()).unwrap();
            index
                .apply("a.png", &|_| Ok(Decision::Append(rec.clone())))
                .unwrap();
            index.flush().unwrap();
        }
        let index = SledDedupIndex::open(temp.path()).unwrap();
        assert_eq!(index.entries("a.png").unwrap(), vec![rec]);
    }
}

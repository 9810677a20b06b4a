//! Durable embedded state store on LMDB
//!
//! Values are stored as an 8-byte big-endian ETag followed by the payload.
//! The ETag counter lives in a separate database and is advanced inside the
//! same write transaction as the value, so tags stay monotonic across
//! restarts. All LMDB work runs on the blocking pool.
//!
//! [`LmdbJournal`] keeps the reconciliation journal in the same environment,
//! so events deferred before a restart are still relayed after it.

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use std::path::Path;

use crate::journal::now_millis;
use crate::store::check_precondition;
use crate::{
    Concurrency, ETag, EventEnvelope, EventId, JournalEntry, JournalError, ReconciliationJournal,
    StateKey, StateStore, StoreError, Versioned,
};

const COUNTER_KEY: &str = "etag-counter";
const SEQUENCE_KEY: &str = "journal-sequence";
const TAG_LEN: usize = 8;

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string().into_boxed_str())
}

fn journal_err(e: impl std::fmt::Display) -> JournalError {
    JournalError::Storage(e.to_string().into_boxed_str())
}

fn read_tag(bytes: &[u8]) -> Option<u64> {
    let tag: [u8; TAG_LEN] = bytes.get(..TAG_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(tag))
}

#[derive(Clone)]
pub struct LmdbStateStore {
    env: Env,
    state: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
    journal: Database<Str, Bytes>,
}

impl LmdbStateStore {
    /// Open (creating if needed) a store in directory `path`
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path.as_ref()).map_err(backend)?;
        // SAFETY: each directory is opened at most once per process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(3)
                .open(path.as_ref())
        }
        .map_err(backend)?;

        let mut wtxn = env.write_txn().map_err(backend)?;
        let state = env.create_database(&mut wtxn, Some("state")).map_err(backend)?;
        let meta = env.create_database(&mut wtxn, Some("meta")).map_err(backend)?;
        let journal = env.create_database(&mut wtxn, Some("journal")).map_err(backend)?;
        wtxn.commit().map_err(backend)?;

        tracing::debug!(path = %path.as_ref().display(), "opened lmdb state store");
        Ok(Self { env, state, meta, journal })
    }

    /// Reconciliation journal stored alongside the state
    pub fn journal(&self) -> LmdbJournal {
        LmdbJournal { env: self.env.clone(), entries: self.journal, meta: self.meta }
    }

    fn read(&self, txn: &RoTxn<'_>, key: &StateKey) -> Result<Option<Versioned>, StoreError> {
        let Some(bytes) = self.state.get(txn, key.as_str()).map_err(backend)? else {
            return Ok(None);
        };
        let etag = read_tag(bytes).ok_or_else(|| StoreError::Serialization {
            key: key.as_str().into(),
            reason: "stored value has no etag header".into(),
        })?;
        Ok(Some(Versioned { etag: ETag(etag), data: bytes[TAG_LEN..].to_vec() }))
    }

    fn save_blocking(&self, key: &StateKey, data: &[u8], concurrency: Concurrency) -> Result<ETag, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let current = self.read(&wtxn, key)?.map(|v| v.etag);
        check_precondition(key, current, concurrency)?;

        let last = self
            .meta
            .get(&wtxn, COUNTER_KEY)
            .map_err(backend)?
            .and_then(read_tag)
            .unwrap_or(0);
        let next = last + 1;
        self.meta.put(&mut wtxn, COUNTER_KEY, &next.to_be_bytes()).map_err(backend)?;

        let mut value = Vec::with_capacity(TAG_LEN + data.len());
        value.extend_from_slice(&next.to_be_bytes());
        value.extend_from_slice(data);
        self.state.put(&mut wtxn, key.as_str(), &value).map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(ETag(next))
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&LmdbStateStore) -> Result<R, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await.map_err(backend)?
    }
}

#[async_trait]
impl StateStore for LmdbStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<Versioned>, StoreError> {
        let key = key.clone();
        self.blocking(move |s| {
            let rtxn = s.env.read_txn().map_err(backend)?;
            s.read(&rtxn, &key)
        })
        .await
    }

    async fn save(&self, key: &StateKey, data: Vec<u8>, concurrency: Concurrency) -> Result<ETag, StoreError> {
        let key = key.clone();
        self.blocking(move |s| s.save_blocking(&key, &data, concurrency)).await
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.blocking(move |s| {
            let mut wtxn = s.env.write_txn().map_err(backend)?;
            s.state.delete(&mut wtxn, key.as_str()).map_err(backend)?;
            wtxn.commit().map_err(backend)
        })
        .await
    }
}

/// Durable reconciliation journal, one JSON entry per event id.
///
/// Journal calls are synchronous and short; they run on the caller's thread.
#[derive(Clone)]
pub struct LmdbJournal {
    env: Env,
    entries: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
}

impl LmdbJournal {
    fn read(&self, txn: &RoTxn<'_>, event_id: &str) -> Result<Option<JournalEntry>, JournalError> {
        match self.entries.get(txn, event_id).map_err(journal_err)? {
            Some(bytes) => serde_json::from_slice(bytes).map(Some).map_err(journal_err),
            None => Ok(None),
        }
    }

    fn write(&self, txn: &mut RwTxn<'_>, entry: &JournalEntry) -> Result<(), JournalError> {
        let bytes = serde_json::to_vec(entry).map_err(journal_err)?;
        self.entries
            .put(txn, &entry.event.id.to_string(), &bytes)
            .map_err(journal_err)
    }
}

impl ReconciliationJournal for LmdbJournal {
    fn append(&self, event: EventEnvelope, reason: &str) -> Result<u64, JournalError> {
        let mut wtxn = self.env.write_txn().map_err(journal_err)?;
        let id = event.id.to_string();

        // Same event journaled twice keeps a single entry
        if let Some(mut existing) = self.read(&wtxn, &id)? {
            existing.last_error = reason.into();
            self.write(&mut wtxn, &existing)?;
            wtxn.commit().map_err(journal_err)?;
            return Ok(existing.sequence);
        }

        let last = self
            .meta
            .get(&wtxn, SEQUENCE_KEY)
            .map_err(journal_err)?
            .and_then(read_tag)
            .unwrap_or(0);
        let sequence = last + 1;
        self.meta
            .put(&mut wtxn, SEQUENCE_KEY, &sequence.to_be_bytes())
            .map_err(journal_err)?;

        let entry = JournalEntry {
            sequence,
            recorded_at_millis: now_millis(),
            event,
            last_error: reason.into(),
            relay_attempts: 0,
        };
        self.write(&mut wtxn, &entry)?;
        wtxn.commit().map_err(journal_err)?;
        Ok(sequence)
    }

    fn pending(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let rtxn = self.env.read_txn().map_err(journal_err)?;
        let mut entries = Vec::new();
        for item in self.entries.iter(&rtxn).map_err(journal_err)? {
            let (_, bytes) = item.map_err(journal_err)?;
            entries.push(serde_json::from_slice::<JournalEntry>(bytes).map_err(journal_err)?);
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    fn record_attempt(&self, event_id: EventId, error: &str) -> Result<(), JournalError> {
        let mut wtxn = self.env.write_txn().map_err(journal_err)?;
        let mut entry = self
            .read(&wtxn, &event_id.to_string())?
            .ok_or(JournalError::NotFound(event_id))?;
        entry.relay_attempts += 1;
        entry.last_error = error.into();
        self.write(&mut wtxn, &entry)?;
        wtxn.commit().map_err(journal_err)
    }

    fn resolve(&self, event_id: EventId) -> Result<(), JournalError> {
        let mut wtxn = self.env.write_txn().map_err(journal_err)?;
        self.entries
            .delete(&mut wtxn, &event_id.to_string())
            .map_err(journal_err)?;
        wtxn.commit().map_err(journal_err)
    }
}

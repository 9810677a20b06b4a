//! Reconciliation journal
//!
//! Events whose publish exhausted its retries are written here, together
//! with the reason, so a relay can republish them later with their original
//! event id.

use serde::{Deserialize, Serialize};

use crate::{EventEnvelope, EventId};

/// Journal storage trait
pub trait ReconciliationJournal: Send + Sync + 'static {
    fn append(&self, event: EventEnvelope, reason: &str) -> Result<u64, JournalError>;
    fn pending(&self) -> Result<Vec<JournalEntry>, JournalError>;
    fn record_attempt(&self, event_id: EventId, error: &str) -> Result<(), JournalError>;
    fn resolve(&self, event_id: EventId) -> Result<(), JournalError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub recorded_at_millis: u64,
    pub event: EventEnvelope,
    pub last_error: Box<str>,
    /// Relay attempts made since the entry was recorded
    pub relay_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    #[error("Not found: {0}")]
    NotFound(EventId),
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory journal
pub struct InMemoryJournal {
    data: std::sync::RwLock<Vec<JournalEntry>>,
    counter: std::sync::atomic::AtomicU64,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self {
            data: std::sync::RwLock::new(Vec::new()),
            counter: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl ReconciliationJournal for InMemoryJournal {
    fn append(&self, event: EventEnvelope, reason: &str) -> Result<u64, JournalError> {
        let mut data = self.data.write().map_err(|e| JournalError::Storage(e.to_string().into()))?;

        // Same event journaled twice keeps a single entry
        if let Some(existing) = data.iter_mut().find(|e| e.event.id == event.id) {
            existing.last_error = reason.into();
            return Ok(existing.sequence);
        }

        let seq = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        data.push(JournalEntry {
            sequence: seq,
            recorded_at_millis: now_millis(),
            event,
            last_error: reason.into(),
            relay_attempts: 0,
        });
        Ok(seq)
    }

    fn pending(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let data = self.data.read().map_err(|e| JournalError::Storage(e.to_string().into()))?;
        Ok(data.clone())
    }

    fn record_attempt(&self, event_id: EventId, error: &str) -> Result<(), JournalError> {
        let mut data = self.data.write().map_err(|e| JournalError::Storage(e.to_string().into()))?;
        let entry = data
            .iter_mut()
            .find(|e| e.event.id == event_id)
            .ok_or(JournalError::NotFound(event_id))?;
        entry.relay_attempts += 1;
        entry.last_error = error.into();
        Ok(())
    }

    fn resolve(&self, event_id: EventId) -> Result<(), JournalError> {
        let mut data = self.data.write().map_err(|e| JournalError::Storage(e.to_string().into()))?;
        data.retain(|e| e.event.id != event_id);
        Ok(())
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

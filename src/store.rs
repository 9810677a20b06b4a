//! Key-value state store contract
//!
//! The contract is deliberately small: `get`, `save`, `delete` on opaque
//! bytes, nothing spanning more than one key. Each read returns an [`ETag`]
//! and each write states which [`Concurrency`] rule it expects, which is
//! enough for callers to build create-if-absent and optimistic
//! read-modify-write on top of any backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::StateKey;

/// Version tag of a stored value. Changes on every write to the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ETag(pub u64);

/// Stored bytes together with their version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub etag: ETag,
    pub data: Vec<u8>,
}

/// Write precondition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Concurrency {
    /// Unconditional overwrite
    LastWriteWins,
    /// Only succeeds if the key does not exist yet
    FirstWrite,
    /// Only succeeds if the key still carries this version
    Match(ETag),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Write precondition not met
    #[error("write conflict on {key}")]
    Conflict { key: Box<str> },

    #[error("state store unavailable: {0}")]
    Unavailable(Box<str>),

    #[error("state store {operation} on {key} timed out after {millis}ms")]
    Timeout {
        operation: &'static str,
        key: Box<str>,
        millis: u64,
    },

    #[error("failed to encode or decode {key}: {reason}")]
    Serialization { key: Box<str>, reason: Box<str> },

    #[error("state store backend error: {0}")]
    Backend(Box<str>),
}

impl StoreError {
    /// Transient failures are retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Keyed state storage
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &StateKey) -> Result<Option<Versioned>, StoreError>;

    /// Write `data` under `key`, returning the new version
    async fn save(
        &self,
        key: &StateKey,
        data: Vec<u8>,
        concurrency: Concurrency,
    ) -> Result<ETag, StoreError>;

    /// Remove `key`; deleting an absent key is not an error
    async fn delete(&self, key: &StateKey) -> Result<(), StoreError>;
}

/// In-memory store for testing and single-process use
pub struct InMemoryStateStore {
    data: std::sync::RwLock<HashMap<StateKey, Versioned>>,
    counter: AtomicU64,
    fail_writes: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            data: std::sync::RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
            fail_writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently stored that start with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = self
            .data
            .read()
            .map(|d| d.keys().filter(|k| k.as_str().starts_with(prefix)).cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Fail the next `n` saves with [`StoreError::Unavailable`]
    pub fn fail_next_writes(&self, n: u64) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn poisoned(e: impl std::fmt::Display) -> StoreError {
        StoreError::Backend(e.to_string().into_boxed_str())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<Versioned>, StoreError> {
        let data = self.data.read().map_err(Self::poisoned)?;
        Ok(data.get(key).cloned())
    }

    async fn save(
        &self,
        key: &StateKey,
        data: Vec<u8>,
        concurrency: Concurrency,
    ) -> Result<ETag, StoreError> {
        if self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        let mut map = self.data.write().map_err(Self::poisoned)?;
        check_precondition(key, map.get(key).map(|v| v.etag), concurrency)?;

        // Store-wide counter so a deleted and recreated key never reuses a tag
        let etag = ETag(self.counter.fetch_add(1, Ordering::Relaxed));
        map.insert(key.clone(), Versioned { etag, data });
        Ok(etag)
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        let mut map = self.data.write().map_err(Self::poisoned)?;
        map.remove(key);
        Ok(())
    }
}

/// Evaluate a write precondition against the key's current version
pub(crate) fn check_precondition(
    key: &StateKey,
    current: Option<ETag>,
    concurrency: Concurrency,
) -> Result<(), StoreError> {
    let ok = match (concurrency, current) {
        (Concurrency::LastWriteWins, _) => true,
        (Concurrency::FirstWrite, current) => current.is_none(),
        (Concurrency::Match(expected), Some(current)) => expected == current,
        (Concurrency::Match(_), None) => false,
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::Conflict { key: key.as_str().into() })
    }
}

/// Bounds every call on the wrapped store with a timeout.
///
/// A timed-out write may still have been applied; callers retry through
/// their idempotent paths rather than resending blindly.
pub struct TimedStateStore {
    inner: Arc<dyn StateStore>,
    timeout: Duration,
}

impl TimedStateStore {
    pub fn new(inner: Arc<dyn StateStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn timed_out(&self, operation: &'static str, key: &StateKey) -> StoreError {
        StoreError::Timeout {
            operation,
            key: key.as_str().into(),
            millis: self.timeout.as_millis() as u64,
        }
    }
}

#[async_trait]
impl StateStore for TimedStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<Versioned>, StoreError> {
        tokio::time::timeout(self.timeout, self.inner.get(key))
            .await
            .map_err(|_| self.timed_out("get", key))?
    }

    async fn save(
        &self,
        key: &StateKey,
        data: Vec<u8>,
        concurrency: Concurrency,
    ) -> Result<ETag, StoreError> {
        tokio::time::timeout(self.timeout, self.inner.save(key, data, concurrency))
            .await
            .map_err(|_| self.timed_out("save", key))?
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        tokio::time::timeout(self.timeout, self.inner.delete(key))
            .await
            .map_err(|_| self.timed_out("delete", key))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> StateKey {
        StateKey::new("test", id)
    }

    #[tokio::test]
    async fn test_get_save_delete() {
        let store = InMemoryStateStore::new();
        assert!(store.get(&key("a")).await.unwrap().is_none());

        let etag = store.save(&key("a"), b"one".to_vec(), Concurrency::LastWriteWins).await.unwrap();
        let read = store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(read.data, b"one");
        assert_eq!(read.etag, etag);

        store.delete(&key("a")).await.unwrap();
        assert!(store.get(&key("a")).await.unwrap().is_none());
        store.delete(&key("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_write_wins_once() {
        let store = InMemoryStateStore::new();
        store.save(&key("a"), b"1".to_vec(), Concurrency::FirstWrite).await.unwrap();
        let err = store.save(&key("a"), b"2".to_vec(), Concurrency::FirstWrite).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&key("a")).await.unwrap().unwrap().data, b"1");
    }

    #[tokio::test]
    async fn test_etag_match() {
        let store = InMemoryStateStore::new();
        let v1 = store.save(&key("a"), b"1".to_vec(), Concurrency::LastWriteWins).await.unwrap();
        let v2 = store.save(&key("a"), b"2".to_vec(), Concurrency::Match(v1)).await.unwrap();
        assert_ne!(v1, v2);

        let stale = store.save(&key("a"), b"3".to_vec(), Concurrency::Match(v1)).await;
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));

        let missing = store.save(&key("b"), b"x".to_vec(), Concurrency::Match(v2)).await;
        assert!(missing.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_recreated_key_gets_new_etag() {
        let store = InMemoryStateStore::new();
        let v1 = store.save(&key("a"), b"1".to_vec(), Concurrency::FirstWrite).await.unwrap();
        store.delete(&key("a")).await.unwrap();
        let v2 = store.save(&key("a"), b"1".to_vec(), Concurrency::FirstWrite).await.unwrap();
        assert_ne!(v1, v2);
    }

    struct StalledStore;

    #[async_trait]
    impl StateStore for StalledStore {
        async fn get(&self, _key: &StateKey) -> Result<Option<Versioned>, StoreError> {
            std::future::pending().await
        }
        async fn save(&self, _: &StateKey, _: Vec<u8>, _: Concurrency) -> Result<ETag, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &StateKey) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_store_bounds_calls() {
        let store = TimedStateStore::new(Arc::new(StalledStore), Duration::from_millis(50));
        let err = store.get(&key("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "get", millis: 50, .. }));
        assert!(err.is_transient());
    }
}

//! Typed access and conditional updates on top of [`StateStore`]

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::{BookingError, Concurrency, ETag, StateKey, StateStore, StoreError};

/// Value read from the store together with its version
#[derive(Clone, Debug, PartialEq)]
pub struct Tagged<T> {
    pub etag: ETag,
    pub value: T,
}

/// Result of [`StateStoreExt::create_if_absent`]
#[derive(Clone, Debug, PartialEq)]
pub enum Created<T> {
    /// This call wrote the value
    New(Tagged<T>),
    /// Someone else got there first; this is their value
    Existing(Tagged<T>),
}

impl<T> Created<T> {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    pub fn into_tagged(self) -> Tagged<T> {
        match self {
            Self::New(t) | Self::Existing(t) => t,
        }
    }
}

/// What an update closure decided
pub enum Update<T, R> {
    /// Write this value, then return `R`
    Write(T, R),
    /// Leave the stored value alone and return `R`
    Skip(R),
}

fn encode<T: Serialize>(key: &StateKey, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
        key: key.as_str().into(),
        reason: e.to_string().into_boxed_str(),
    })
}

fn decode<T: DeserializeOwned>(key: &StateKey, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
        key: key.as_str().into(),
        reason: e.to_string().into_boxed_str(),
    })
}

/// Backoff between optimistic retries: 1, 2, 4 .. 32 ms
fn conflict_backoff(attempt: u32) -> Duration {
    Duration::from_millis(1u64 << attempt.min(5))
}

#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_json<T>(&self, key: &StateKey) -> Result<Option<Tagged<T>>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(v) => Ok(Some(Tagged { etag: v.etag, value: decode(key, &v.data)? })),
            None => Ok(None),
        }
    }

    async fn save_json<T>(
        &self,
        key: &StateKey,
        value: &T,
        concurrency: Concurrency,
    ) -> Result<ETag, StoreError>
    where
        T: Serialize + Sync,
    {
        let bytes = encode(key, value)?;
        self.save(key, bytes, concurrency).await
    }

    /// Write `value` unless the key already exists, in which case the
    /// existing value is returned. Safe under concurrent callers.
    async fn create_if_absent<T>(&self, key: &StateKey, value: T) -> Result<Created<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        match self.save_json(key, &value, Concurrency::FirstWrite).await {
            Ok(etag) => Ok(Created::New(Tagged { etag, value })),
            Err(e) if e.is_conflict() => match self.get_json::<T>(key).await? {
                Some(existing) => Ok(Created::Existing(existing)),
                // Deleted in between; the caller may retry
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Optimistic read-modify-write.
    ///
    /// Reads the current value (or `None`), lets `f` decide, and writes back
    /// only if the version is unchanged. Conflicts re-read and re-run `f`, at
    /// most `max_attempts` times in total.
    async fn update_json<T, R, F>(
        &self,
        key: &StateKey,
        max_attempts: u32,
        mut f: F,
    ) -> Result<R, BookingError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        R: Send,
        F: FnMut(Option<T>) -> Result<Update<T, R>, BookingError> + Send,
    {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let current = self.get_json::<T>(key).await?;
            let (etag, value) = match current {
                Some(t) => (Some(t.etag), Some(t.value)),
                None => (None, None),
            };

            let (next, result) = match f(value)? {
                Update::Skip(result) => return Ok(result),
                Update::Write(next, result) => (next, result),
            };

            let concurrency = etag.map(Concurrency::Match).unwrap_or(Concurrency::FirstWrite);
            match self.save_json(key, &next, concurrency).await {
                Ok(_) => return Ok(result),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(key = %key, attempt, "optimistic write lost, retrying");
                    if attempt < max_attempts {
                        tokio::time::sleep(conflict_backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(key = %key, attempts = max_attempts, "optimistic update exhausted");
        Err(BookingError::ConcurrencyExhausted { key: key.as_str().into(), attempts: max_attempts })
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

//! Persistent key-value store seam with optimistic concurrency.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque version tag of a stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(pub String);

impl ETag {
    /// Create a fresh, unique tag.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value with its current tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: ETag,
}

/// Precondition for a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Write unconditionally.
    Any,
    /// Only create; fail if the key exists.
    Absent,
    /// Only replace the entry currently carrying this tag.
    Matches(ETag),
}

/// Store errors.
#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("write condition failed for key {key}")]
    Conflict { key: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DictionaryError {
    /// True when the error is a failed write precondition.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DictionaryError::Conflict { .. })
    }
}

/// A durable key-value store with per-entry tags.
///
/// Keys are plain strings; values are JSON documents.
pub trait PersistentDictionary: Send + Sync {
    /// Get the value and tag stored under `key`.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Versioned<serde_json::Value>>, DictionaryError>> + Send;

    /// Store `value` under `key` if `condition` holds, returning the new tag.
    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> impl Future<Output = Result<ETag, DictionaryError>> + Send;

    /// Remove `key`, returning whether it was present.
    fn remove(&self, key: &str) -> impl Future<Output = Result<bool, DictionaryError>> + Send;

    /// All keys currently stored.
    fn keys(&self) -> impl Future<Output = Result<Vec<String>, DictionaryError>> + Send;

    /// Drop the whole store.
    fn delete(&self) -> impl Future<Output = Result<(), DictionaryError>> + Send;

    fn contains_key(&self, key: &str) -> impl Future<Output = Result<bool, DictionaryError>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    fn count(&self) -> impl Future<Output = Result<usize, DictionaryError>> + Send {
        async move { Ok(self.keys().await?.len()) }
    }
}

/// Opens named stores of one backend.
pub trait DictionaryProvider: Send + Sync {
    type Dictionary: PersistentDictionary;

    fn open(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Self::Dictionary, DictionaryError>> + Send;
}

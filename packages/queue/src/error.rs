use queue_core::{DictionaryError, StatusError, TransportError, WorkItemId};
use thiserror::Error;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The transport kept failing after retries.
    #[error("transport failure on channel {channel}: {source}")]
    Transport {
        channel: String,
        #[source]
        source: TransportError,
    },
    #[error("work item store error: {0}")]
    Store(#[from] DictionaryError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("work item {0} has no result category")]
    Unroutable(WorkItemId),
    #[error("work item {0} not found")]
    NotFound(WorkItemId),
}

impl QueueError {
    /// Whether the caller should stop instead of treating this as a degraded
    /// cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Transport { .. })
    }

    /// True when a conditional store write lost a race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_conflict())
    }
}

//! Transport envelope for work items in flight.

use serde::{Deserialize, Serialize};

use crate::WorkItemId;

/// Lightweight envelope carried by the transport.
///
/// Only the [`crate::WorkItem`] is durable; the entry exists while a message
/// is queued or leased. `payload` is opaque to the queue and travels with the
/// message unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemQueueEntry {
    pub work_item_id: WorkItemId,
    pub category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl WorkItemQueueEntry {
    pub fn new(work_item_id: WorkItemId, category: impl Into<String>) -> Self {
        Self {
            work_item_id,
            category: category.into(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Encode to the raw message bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from raw message bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

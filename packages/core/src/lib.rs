//! Core domain types for the work item queue.
//!
//! This crate contains shared types used across all packages:
//! - WorkItem and WorkItemStatus, the durable record of deferred work
//! - WorkItemQueueEntry, the envelope carried by the transport
//! - The PersistentDictionary and CloudQueue seams, with in-memory backends
//! - Queue and processor settings

mod cloud_queue;
mod dictionary;
mod entry;
mod memory;
mod settings;
mod work_item;

pub use cloud_queue::{CloudQueue, LeasedMessage, TransportError};
pub use dictionary::{
    DictionaryError, DictionaryProvider, ETag, PersistentDictionary, Versioned, WriteCondition,
};
pub use entry::WorkItemQueueEntry;
pub use memory::{MemoryCloudQueue, MemoryDictionary, MemoryDictionaryProvider};
pub use settings::{
    DeploymentIdentity, MAX_VISIBILITY_TIMEOUT, ProcessorSettings, QueueSettings, SettingsError,
};
pub use work_item::{
    RESULT_CATEGORY, ResultType, StatusError, WorkItem, WorkItemId, WorkItemStatus,
};

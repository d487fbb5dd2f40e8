//! In-memory implementations of the store and transport seams.
//!
//! Used by tests and local development; they honour the same contracts as the
//! SurrealDB, object-store and cloud queue backends.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cloud_queue::{CloudQueue, LeasedMessage, TransportError};
use crate::dictionary::{
    DictionaryError, DictionaryProvider, ETag, PersistentDictionary, Versioned, WriteCondition,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map-backed [`PersistentDictionary`]. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryDictionary {
    entries: Arc<Mutex<HashMap<String, Versioned<serde_json::Value>>>>,
}

impl MemoryDictionary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentDictionary for MemoryDictionary {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, DictionaryError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<ETag, DictionaryError> {
        let mut entries = lock(&self.entries);
        let current = entries.get(key).map(|entry| &entry.etag);
        let allowed = match (&condition, current) {
            (WriteCondition::Any, _) => true,
            (WriteCondition::Absent, existing) => existing.is_none(),
            (WriteCondition::Matches(expected), Some(existing)) => expected == existing,
            (WriteCondition::Matches(_), None) => false,
        };
        if !allowed {
            return Err(DictionaryError::Conflict {
                key: key.to_string(),
            });
        }

        let etag = ETag::generate();
        entries.insert(
            key.to_string(),
            Versioned {
                value,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn remove(&self, key: &str) -> Result<bool, DictionaryError> {
        Ok(lock(&self.entries).remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, DictionaryError> {
        let mut keys: Vec<String> = lock(&self.entries).keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self) -> Result<(), DictionaryError> {
        lock(&self.entries).clear();
        Ok(())
    }
}

/// Hands out [`MemoryDictionary`] stores by name; reopening a name returns the
/// same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryDictionaryProvider {
    stores: Arc<Mutex<HashMap<String, MemoryDictionary>>>,
}

impl MemoryDictionaryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DictionaryProvider for MemoryDictionaryProvider {
    type Dictionary = MemoryDictionary;

    async fn open(&self, name: &str) -> Result<MemoryDictionary, DictionaryError> {
        if name.trim().is_empty() {
            return Err(DictionaryError::InvalidKey("store name must not be empty".into()));
        }
        Ok(lock(&self.stores)
            .entry(name.to_string())
            .or_default()
            .clone())
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    visible_at: Instant,
    pop_receipt: Option<String>,
    dequeue_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    channels: HashMap<String, VecDeque<StoredMessage>>,
    /// Number of upcoming calls that fail with a transient error.
    pending_failures: u32,
}

impl QueueState {
    fn take_failure(&mut self, operation: &str) -> Result<(), TransportError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(TransportError::Transient(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn channel_mut(&mut self, channel: &str) -> Result<&mut VecDeque<StoredMessage>, TransportError> {
        self.channels
            .get_mut(channel)
            .ok_or_else(|| TransportError::ChannelNotFound(channel.to_string()))
    }
}

/// Map-backed [`CloudQueue`] with real visibility-timeout semantics.
///
/// Clones share the same channels, so two clones behave like two clients of
/// one queue service.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloudQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryCloudQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a channel out-of-band, dropping its messages.
    pub fn delete_channel(&self, channel: &str) -> bool {
        lock(&self.state).channels.remove(channel).is_some()
    }

    /// Make the next `count` operations fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).pending_failures = count;
    }

    /// Names of existing channels.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages in `channel`, leased or not.
    pub fn message_count(&self, channel: &str) -> usize {
        lock(&self.state)
            .channels
            .get(channel)
            .map_or(0, VecDeque::len)
    }
}

impl CloudQueue for MemoryCloudQueue {
    async fn create_if_not_exists(&self, channel: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.take_failure("create")?;
        state.channels.entry(channel.to_string()).or_default();
        Ok(())
    }

    async fn put_message(&self, channel: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.take_failure("put")?;
        state.channel_mut(channel)?.push_back(StoredMessage {
            message_id: ulid::Ulid::new().to_string(),
            body,
            visible_at: Instant::now(),
            pop_receipt: None,
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn get_messages(
        &self,
        channel: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, TransportError> {
        let mut state = lock(&self.state);
        state.take_failure("get")?;
        let now = Instant::now();
        let messages = state.channel_mut(channel)?;

        let mut leased = Vec::new();
        for message in messages.iter_mut() {
            if leased.len() >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let receipt = ulid::Ulid::new().to_string();
            message.pop_receipt = Some(receipt.clone());
            message.visible_at = now + visibility_timeout;
            message.dequeue_count += 1;
            leased.push(LeasedMessage {
                message_id: message.message_id.clone(),
                pop_receipt: receipt,
                body: message.body.clone(),
                dequeue_count: message.dequeue_count,
            });
        }
        Ok(leased)
    }

    async fn delete_message(
        &self,
        channel: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.take_failure("delete")?;
        let messages = state.channel_mut(channel)?;
        let position = messages.iter().position(|message| {
            message.message_id == message_id
                && message.pop_receipt.as_deref() == Some(pop_receipt)
        });
        match position {
            Some(index) => {
                messages.remove(index);
                Ok(())
            }
            None => Err(TransportError::MessageNotFound(message_id.to_string())),
        }
    }
}

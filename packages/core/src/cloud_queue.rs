//! Cloud queue seam: named channels of opaque messages with lease semantics.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// A message leased from a channel.
///
/// The message stays invisible to other readers until the visibility timeout
/// elapses or it is deleted with `pop_receipt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedMessage {
    pub message_id: String,
    pub pop_receipt: String,
    pub body: Vec<u8>,
    /// How many times this message has been leased, including this one.
    pub dequeue_count: u32,
}

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("message not found or receipt expired: {0}")]
    MessageNotFound(String),
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Primitive queue operations provided by the hosting platform.
pub trait CloudQueue: Send + Sync {
    /// Create `channel` unless it already exists.
    fn create_if_not_exists(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Append a message to `channel`.
    fn put_message(
        &self,
        channel: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Lease up to `max_messages` visible messages for `visibility_timeout`.
    fn get_messages(
        &self,
        channel: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> impl Future<Output = Result<Vec<LeasedMessage>, TransportError>> + Send;

    /// Delete a leased message; the receipt must be the latest one issued.
    fn delete_message(
        &self,
        channel: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

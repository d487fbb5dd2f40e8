//! Category-keyed message transport over a [`CloudQueue`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use queue_core::{
    CloudQueue, DeploymentIdentity, MAX_VISIBILITY_TIMEOUT, QueueSettings, TransportError,
    WorkItemId, WorkItemQueueEntry,
};
use tracing::{debug, error, warn};

use crate::QueueError;

/// Longest channel name the transport accepts.
pub const MAX_CHANNEL_NAME_LEN: usize = 63;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lower-case `value` and strip everything outside `[a-z0-9-]`, collapsing
/// and trimming dashes.
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if c == '-' && !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Channel carrying `category` for `deployment`.
pub fn channel_name(deployment: &str, category: &str) -> String {
    let mut name = sanitize(&format!("{}-{}", sanitize(deployment), sanitize(category)));
    name.truncate(MAX_CHANNEL_NAME_LEN);
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Proof of a lease, needed to delete the leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt {
    pub message_id: String,
    pub pop_receipt: String,
    pub channel: String,
}

#[derive(Debug)]
struct Lease {
    receipt: MessageReceipt,
    leased_at: Instant,
}

/// Maps `(category, deployment)` pairs onto independent channels.
///
/// Producers write to the active deployment's channels, consumers lease from
/// the current deployment's. Receipts are kept per `(channel, work item)` so
/// the same item can be in flight on its work channel and a result channel.
/// Receipts older than the visibility timeout are dropped on the next dequeue.
pub struct CategorizedQueueTransport<Q> {
    queue: Q,
    deployment: DeploymentIdentity,
    visibility_timeout: Duration,
    retries: u32,
    retry_delay: Duration,
    receipts: Mutex<HashMap<(String, WorkItemId), Lease>>,
    known_channels: Mutex<HashSet<String>>,
}

impl<Q: CloudQueue> CategorizedQueueTransport<Q> {
    pub fn new(queue: Q, settings: &QueueSettings, deployment: DeploymentIdentity) -> Self {
        Self {
            queue,
            deployment,
            visibility_timeout: clamp_visibility_timeout(settings.visibility_timeout()),
            retries: settings.enqueue_retries,
            retry_delay: settings.retry_delay(),
            receipts: Mutex::new(HashMap::new()),
            known_channels: Mutex::new(HashSet::new()),
        }
    }

    /// Override the lease duration; the same bounds apply.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = clamp_visibility_timeout(timeout);
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    pub fn deployment(&self) -> &DeploymentIdentity {
        &self.deployment
    }

    /// Number of leases currently awaiting delete.
    pub fn pending_receipts(&self) -> usize {
        lock(&self.receipts).len()
    }

    /// Submit `entry` to its category's channel.
    pub async fn enqueue(&self, entry: &WorkItemQueueEntry) -> Result<(), QueueError> {
        let channel = channel_name(self.deployment.enqueue_target(), &entry.category);
        let body = entry.to_bytes()?;

        self.ensure_channel(&channel).await?;
        let mut result = self.put(&channel, &body).await;

        if let Err(TransportError::ChannelNotFound(_)) = result {
            warn!(%channel, "Channel disappeared, recreating");
            lock(&self.known_channels).remove(&channel);
            self.ensure_channel(&channel).await?;
            result = self.put(&channel, &body).await;
        }

        match result {
            Ok(()) => {
                debug!(%channel, work_item_id = %entry.work_item_id, "Enqueued entry");
                Ok(())
            }
            Err(source) => Err(self.exhausted(channel, "enqueue", source)),
        }
    }

    /// Lease up to `max_entries` entries of `category`.
    ///
    /// A channel that does not exist yet yields no entries.
    pub async fn dequeue(
        &self,
        category: &str,
        max_entries: usize,
    ) -> Result<Vec<WorkItemQueueEntry>, QueueError> {
        if max_entries == 0 {
            return Ok(Vec::new());
        }
        let channel = channel_name(&self.deployment.current, category);
        let leased = self
            .with_retries(&channel, "dequeue", || {
                self.queue
                    .get_messages(&channel, max_entries, self.visibility_timeout)
            })
            .await;

        let leased = match leased {
            Ok(leased) => leased,
            Err(TransportError::ChannelNotFound(_)) => {
                debug!(%channel, "Channel does not exist yet");
                lock(&self.known_channels).remove(&channel);
                return Ok(Vec::new());
            }
            Err(source) => return Err(self.exhausted(channel, "dequeue", source)),
        };

        self.prune_expired_receipts();

        let now = Instant::now();
        let mut entries = Vec::with_capacity(leased.len());
        for message in leased {
            match WorkItemQueueEntry::from_bytes(&message.body) {
                Ok(entry) => {
                    let receipt = MessageReceipt {
                        message_id: message.message_id,
                        pop_receipt: message.pop_receipt,
                        channel: channel.clone(),
                    };
                    lock(&self.receipts).insert(
                        (channel.clone(), entry.work_item_id),
                        Lease {
                            receipt,
                            leased_at: now,
                        },
                    );
                    entries.push(entry);
                }
                Err(err) => {
                    warn!(
                        %channel,
                        message_id = %message.message_id,
                        error = %err,
                        "Discarding undecodable message"
                    );
                    if let Err(err) = self
                        .queue
                        .delete_message(&channel, &message.message_id, &message.pop_receipt)
                        .await
                    {
                        warn!(%channel, error = %err, "Failed to discard undecodable message");
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Delete the leased message for `entry`.
    ///
    /// Returns `false` without touching the transport when no receipt is on
    /// file, or when the lease has already expired.
    pub async fn delete(&self, entry: &WorkItemQueueEntry) -> Result<bool, QueueError> {
        let channel = channel_name(&self.deployment.current, &entry.category);
        let lease = lock(&self.receipts).remove(&(channel.clone(), entry.work_item_id));
        let Some(Lease { receipt, .. }) = lease else {
            warn!(
                %channel,
                work_item_id = %entry.work_item_id,
                "No receipt on file, skipping delete"
            );
            return Ok(false);
        };

        let deleted = self
            .with_retries(&channel, "delete", || {
                self.queue
                    .delete_message(&receipt.channel, &receipt.message_id, &receipt.pop_receipt)
            })
            .await;

        match deleted {
            Ok(()) => Ok(true),
            Err(TransportError::MessageNotFound(_) | TransportError::ChannelNotFound(_)) => {
                warn!(
                    %channel,
                    work_item_id = %entry.work_item_id,
                    "Lease expired before delete; entry may be redelivered"
                );
                Ok(false)
            }
            Err(source) => Err(self.exhausted(channel, "delete", source)),
        }
    }

    /// Drop the receipt for `entry` without deleting the message.
    pub fn release(&self, entry: &WorkItemQueueEntry) -> bool {
        let channel = channel_name(&self.deployment.current, &entry.category);
        lock(&self.receipts)
            .remove(&(channel, entry.work_item_id))
            .is_some()
    }

    fn prune_expired_receipts(&self) {
        let timeout = self.visibility_timeout;
        let mut receipts = lock(&self.receipts);
        let before = receipts.len();
        receipts.retain(|_, lease| lease.leased_at.elapsed() < timeout);
        let pruned = before - receipts.len();
        if pruned > 0 {
            debug!(pruned, "Dropped receipts for expired leases");
        }
    }

    async fn ensure_channel(&self, channel: &str) -> Result<(), QueueError> {
        if lock(&self.known_channels).contains(channel) {
            return Ok(());
        }
        self.with_retries(channel, "create", || self.queue.create_if_not_exists(channel))
            .await
            .map_err(|source| self.exhausted(channel.to_string(), "create", source))?;
        lock(&self.known_channels).insert(channel.to_string());
        Ok(())
    }

    async fn put(&self, channel: &str, body: &[u8]) -> Result<(), TransportError> {
        self.with_retries(channel, "enqueue", || {
            self.queue.put_message(channel, body.to_vec())
        })
        .await
    }

    /// Run `call`, retrying transient failures with a fixed delay.
    async fn with_retries<T, F, Fut>(
        &self,
        channel: &str,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(channel, operation, attempt, error = %err, "Transient transport failure, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    fn exhausted(&self, channel: String, operation: &str, source: TransportError) -> QueueError {
        error!(
            alert = true,
            %channel,
            operation,
            retries = self.retries,
            error = %source,
            "Transport operation failed"
        );
        QueueError::Transport { channel, source }
    }
}

fn clamp_visibility_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() || timeout > MAX_VISIBILITY_TIMEOUT {
        warn!(
            requested_secs = timeout.as_secs(),
            max_secs = MAX_VISIBILITY_TIMEOUT.as_secs(),
            "Visibility timeout out of range, using maximum"
        );
        return MAX_VISIBILITY_TIMEOUT;
    }
    timeout
}

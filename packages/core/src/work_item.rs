//! Work item domain types: the durable record of a unit of deferred work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Category prefix used for routed results.
pub const RESULT_CATEGORY: &str = "results";

/// Unique identifier for a work item, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub Ulid);

impl WorkItemId {
    /// Create a new unique work item ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a work item ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a processed result is made retrievable by consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    /// Results land in one category any consumer may read.
    #[default]
    Shared,
    /// Results land in a category private to the submitting source.
    PerSource,
    /// Results are kept on the record only; nothing is routed.
    Discard,
}

impl ResultType {
    /// Transport category carrying results of this type for `source`.
    ///
    /// Returns `None` for [`ResultType::Discard`].
    pub fn result_category(self, source: &str) -> Option<String> {
        match self {
            ResultType::Shared => Some(RESULT_CATEGORY.to_string()),
            ResultType::PerSource => Some(format!("{RESULT_CATEGORY}-{source}")),
            ResultType::Discard => None,
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultType::Shared => write!(f, "shared"),
            ResultType::PerSource => write!(f, "per_source"),
            ResultType::Discard => write!(f, "discard"),
        }
    }
}

/// Lifecycle status of a work item.
///
/// Moves forward only: `Queued -> InProgress -> {Processed | Completed | Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting in the transport for a processor.
    #[default]
    Queued,
    /// Leased and being processed.
    InProgress,
    /// Processed, result routed to a result category.
    Processed,
    /// Processed, no result routing.
    Completed,
    /// Processing failed; `result` holds the error detail.
    Failed,
}

impl WorkItemStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Processed | WorkItemStatus::Completed | WorkItemStatus::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            WorkItemStatus::Queued => 0,
            WorkItemStatus::InProgress => 1,
            WorkItemStatus::Processed | WorkItemStatus::Completed | WorkItemStatus::Failed => 2,
        }
    }

    /// Check if moving from `self` to `next` keeps the lifecycle forward-only.
    ///
    /// `InProgress -> InProgress` is allowed so a redelivered lease can be
    /// picked up again.
    pub fn can_advance_to(self, next: WorkItemStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank() || (self == next && self == WorkItemStatus::InProgress)
    }

    /// Get a simple status string for display.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Queued => "queued",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Processed => "processed",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("work item {id} cannot move from {from} to {to}")]
pub struct StatusError {
    pub id: WorkItemId,
    pub from: WorkItemStatus,
    pub to: WorkItemStatus,
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier for this work item.
    pub id: WorkItemId,
    /// Logical queue partition; selects the transport channel.
    pub category: String,
    /// Submitter identity, used for result routing.
    pub source: String,
    /// How the result is routed once processed.
    #[serde(default)]
    pub result_type: ResultType,
    /// Current status.
    #[serde(default)]
    pub status: WorkItemStatus,
    /// Serialized request payload.
    pub content: String,
    /// Serialized response payload, or error detail when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dequeue_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_complete_time: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Create a new queued work item.
    pub fn new(
        category: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkItemId::new(),
            category: category.into(),
            source: source.into(),
            result_type: ResultType::default(),
            status: WorkItemStatus::Queued,
            content: content.into(),
            result: None,
            queued_time: None,
            dequeue_time: None,
            processing_start_time: None,
            processing_complete_time: None,
        }
    }

    /// Set the result routing for this work item.
    pub fn with_result_type(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    /// Move to `next`, refusing any backwards or post-terminal transition.
    pub fn advance(&mut self, next: WorkItemStatus) -> Result<(), StatusError> {
        if !self.status.can_advance_to(next) {
            return Err(StatusError {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Category the result of this item is routed to, if any.
    pub fn result_category(&self) -> Option<String> {
        self.result_type.result_category(&self.source)
    }

    /// Terminal status this item finishes in when processing succeeds.
    pub fn success_status(&self) -> WorkItemStatus {
        match self.result_type {
            ResultType::Discard => WorkItemStatus::Completed,
            ResultType::Shared | ResultType::PerSource => WorkItemStatus::Processed,
        }
    }

    /// Time spent waiting in the queue, once dequeued.
    pub fn queue_latency(&self) -> Option<chrono::Duration> {
        Some(self.dequeue_time? - self.queued_time?)
    }

    /// Time spent in the processor, once finished.
    pub fn processing_latency(&self) -> Option<chrono::Duration> {
        Some(self.processing_complete_time? - self.processing_start_time?)
    }

    /// Whether this item is terminal and finished before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal()
            && self
                .processing_complete_time
                .is_some_and(|completed| completed < cutoff)
    }
}

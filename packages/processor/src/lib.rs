//! Polling loop that feeds queued work items to pluggable processors.
//!
//! # Architecture
//!
//! - `QueueProcessor` - Sequential poll/process/sleep loop over a set of categories
//! - `WorkItemProcessor` - The pluggable per-item contract
//! - `ProcessorRegistry` - Dispatches to a processor by category
//! - `QueueProcessorStats` - Per-category counters and latencies
//!
//! # Usage
//!
//! ```ignore
//! use processor::{QueueProcessor, ProcessorRegistry, work_item_processor};
//!
//! let mut registry = ProcessorRegistry::new();
//! registry.register("echo", work_item_processor!(|item| {
//!     let mut item = item;
//!     item.result = Some(item.content.clone());
//!     Ok(item)
//! }));
//!
//! let processor = QueueProcessor::new(queue, registry.categories(), registry, settings);
//! processor.run(cancel_token).await?;
//! ```

mod backoff;
mod error;
mod handler;
mod processor;
mod stats;

pub use backoff::{PeriodicTask, PollBackoff, WarningTracker};
pub use error::ProcessorError;
pub use handler::{
    ErrorKind, FnProcessor, ProcessFuture, ProcessResult, ProcessingError, ProcessorRegistry,
    WorkItemProcessor,
};
pub use processor::QueueProcessor;
pub use stats::{CategoryStats, LatencySummary, QueueProcessorStats, StatsSnapshot};

/// Re-exported for processors and the `work_item_processor!` macro.
pub use queue_core::WorkItem;
pub use tokio_util::sync::CancellationToken;

//! Categorized work item queue.
//!
//! - `CategorizedQueueTransport` maps categories onto cloud queue channels
//!   and tracks lease receipts
//! - `Queue` owns the work item store and the processing lifecycle

mod error;
mod queue;
pub mod transport;

pub use error::QueueError;
pub use queue::{CleanupReport, Queue};
pub use transport::{CategorizedQueueTransport, MessageReceipt, channel_name, sanitize};

use queue_core::WorkItemId;
use thiserror::Error;
use workqueue::QueueError;

use crate::ProcessingError;

/// Reasons the processing loop stopped.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("fatal error processing work item {work_item_id}: {source}")]
    Fatal {
        work_item_id: WorkItemId,
        #[source]
        source: ProcessingError,
    },
    #[error("queue failure: {0}")]
    Queue(#[from] QueueError),
}

//! The polling loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use queue_core::{CloudQueue, PersistentDictionary, ProcessorSettings, WorkItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workqueue::{Queue, QueueError};

use crate::{
    PeriodicTask, PollBackoff, ProcessingError, ProcessorError, QueueProcessorStats,
    WarningTracker, WorkItemProcessor,
};

/// Drives one sequential poll, process and sleep loop over a set of
/// categories.
///
/// Any number of processors may share categories; leases keep them from
/// working on the same item at the same time.
pub struct QueueProcessor<Q, D, P> {
    queue: Arc<Queue<Q, D>>,
    categories: Vec<String>,
    processor: P,
    settings: ProcessorSettings,
    stats: Arc<QueueProcessorStats>,
}

/// Mutable loop state, kept out of `self` so `run` can take `&self`.
struct LoopState {
    backoff: PollBackoff,
    warnings: WarningTracker,
    cleanup: PeriodicTask,
    log_stats: PeriodicTask,
    /// Set when the current cycle logged a warning.
    degraded: bool,
}

impl<Q, D, P> QueueProcessor<Q, D, P>
where
    Q: CloudQueue,
    D: PersistentDictionary,
    P: WorkItemProcessor,
{
    pub fn new(
        queue: Arc<Queue<Q, D>>,
        categories: impl IntoIterator<Item = impl Into<String>>,
        processor: P,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            queue,
            categories: categories.into_iter().map(Into::into).collect(),
            processor,
            settings,
            stats: Arc::new(QueueProcessorStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<QueueProcessorStats> {
        self.stats.clone()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Cancellation is checked before each poll, between items and during
    /// every sleep; an item already handed to the processor is finished first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProcessorError> {
        let start = Instant::now();
        let mut state = LoopState {
            backoff: PollBackoff::new(&self.settings),
            warnings: WarningTracker::new(self.settings.max_warnings, self.settings.warning_wait()),
            cleanup: PeriodicTask::new(self.settings.work_item_cleanup_frequency(), start),
            log_stats: PeriodicTask::new(self.settings.log_stats_frequency(), start),
            degraded: false,
        };

        info!(categories = ?self.categories, "Queue processor started");

        while !cancel.is_cancelled() {
            state.degraded = false;
            let now = Instant::now();
            if state.cleanup.is_due(now) {
                self.cleanup(&mut state).await?;
            }
            if state.log_stats.is_due(now) {
                info!(stats = %self.stats, "Queue processor stats");
            }

            let items = self.poll(&mut state).await?;
            if !items.is_empty() {
                state.backoff.reset();
                self.process_batch(items, &cancel, &mut state).await?;
                if !state.degraded {
                    state.warnings.reset();
                }
                continue;
            }

            let wait = state.backoff.next_wait(Instant::now());
            debug!(wait_ms = wait.as_millis() as u64, "No work items, backing off");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(stats = %self.stats, "Queue processor stopped");
        Ok(())
    }

    /// Dequeue up to the batch size, giving each category the capacity left
    /// over by the ones before it.
    async fn poll(&self, state: &mut LoopState) -> Result<Vec<WorkItem>, ProcessorError> {
        let mut batch = Vec::new();
        for category in &self.categories {
            let remaining = self.settings.max_poll_batch_size.saturating_sub(batch.len());
            if remaining == 0 {
                break;
            }
            match self.queue.dequeue_work_items(category, remaining).await {
                Ok(items) => {
                    for item in &items {
                        self.stats.record_dequeued(item);
                    }
                    batch.extend(items);
                }
                Err(e) => self.degraded(state, "Dequeue failed", e)?,
            }
        }
        Ok(batch)
    }

    async fn process_batch(
        &self,
        items: Vec<WorkItem>,
        cancel: &CancellationToken,
        state: &mut LoopState,
    ) -> Result<(), ProcessorError> {
        for item in items {
            if cancel.is_cancelled() {
                debug!(work_item_id = %item.id, "Cancelled, leaving leased item for redelivery");
                self.queue.release_work_item(&item);
                continue;
            }
            self.process_item(item, state).await?;
        }
        Ok(())
    }

    async fn process_item(&self, item: WorkItem, state: &mut LoopState) -> Result<(), ProcessorError> {
        let claimed = match self.queue.begin_processing(&item).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return Ok(()),
            Err(e) => return self.degraded(state, "Could not claim work item", e),
        };

        let outcome = AssertUnwindSafe(self.processor.process(claimed.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessingError::recoverable(panic_message(&panic))));

        match outcome {
            Ok(output) => match self.queue.complete_processing(output).await {
                Ok(done) => {
                    self.stats.record_processed(&done);
                    debug!(work_item_id = %done.id, status = %done.status, "Work item processed");
                    Ok(())
                }
                Err(QueueError::Status(rejected)) => {
                    warn!(
                        work_item_id = %claimed.id,
                        category = %claimed.category,
                        error = %rejected,
                        "Processor returned a status its result type does not allow"
                    );
                    self.escalate(state);
                    match self.queue.fail_processing(&claimed, rejected.to_string()).await {
                        Ok(failed) => {
                            self.stats.record_failed(&failed);
                            Ok(())
                        }
                        Err(e) => self.degraded(state, "Could not record failed work item", e),
                    }
                }
                Err(e) => self.degraded(state, "Could not record processed work item", e),
            },
            Err(err) => {
                let failed = match self.queue.fail_processing(&claimed, err.to_string()).await {
                    Ok(failed) => failed,
                    Err(e) if err.is_fatal() => {
                        warn!(work_item_id = %claimed.id, error = %e, "Could not record failed work item");
                        claimed.clone()
                    }
                    Err(e) => return self.degraded(state, "Could not record failed work item", e),
                };
                self.stats.record_failed(&failed);

                if err.is_fatal() {
                    error!(
                        alert = true,
                        work_item_id = %claimed.id,
                        category = %claimed.category,
                        error = %err,
                        "Unhandled fatal error while processing work item, stopping"
                    );
                    return Err(ProcessorError::Fatal {
                        work_item_id: claimed.id,
                        source: err,
                    });
                }

                warn!(
                    work_item_id = %claimed.id,
                    category = %claimed.category,
                    error = %err,
                    "Work item processing failed"
                );
                self.escalate(state);
                Ok(())
            }
        }
    }

    async fn cleanup(&self, state: &mut LoopState) -> Result<(), ProcessorError> {
        match self.queue.cleanup_work_items().await {
            Ok(report) => {
                debug!(%report, "Cleanup finished");
                Ok(())
            }
            Err(e) => self.degraded(state, "Work item cleanup failed", e),
        }
    }

    /// Log a recoverable queue problem, or stop on a fatal one.
    fn degraded(&self, state: &mut LoopState, context: &str, err: QueueError) -> Result<(), ProcessorError> {
        if err.is_fatal() {
            error!(alert = true, error = %err, "{context}, stopping queue processor");
            return Err(err.into());
        }
        warn!(error = %err, "{context}");
        self.escalate(state);
        Ok(())
    }

    fn escalate(&self, state: &mut LoopState) {
        state.degraded = true;
        if state.warnings.record(Instant::now()) {
            error!(
                alert = true,
                max_warnings = self.settings.max_warnings,
                window_secs = self.settings.warning_wait_secs,
                "Queue processor keeps hitting warnings"
            );
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("processor panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("processor panicked: {message}")
    } else {
        "processor panicked".to_string()
    }
}

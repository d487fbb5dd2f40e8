//! Work item orchestration: durable records plus transport entries.

use chrono::{DateTime, Utc};
use queue_core::{
    CloudQueue, DeploymentIdentity, DictionaryProvider, ETag, PersistentDictionary, QueueSettings,
    ResultType, StatusError, WorkItem, WorkItemId, WorkItemQueueEntry, WorkItemStatus,
    WriteCondition,
};
use tracing::{debug, info, warn};

use crate::{CategorizedQueueTransport, QueueError};

/// Outcome of one cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Records examined.
    pub scanned: usize,
    /// Expired terminal records removed from the primary store.
    pub removed: usize,
    /// Failed records copied to the failed-item store before removal.
    pub archived_failures: usize,
    /// `InProgress` records older than the retention period. Left in place.
    pub stale_in_progress: usize,
    /// Records that could not be decoded or removed.
    pub errors: usize,
}

impl std::fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned={} removed={} archived_failures={} stale_in_progress={} errors={}",
            self.scanned, self.removed, self.archived_failures, self.stale_in_progress, self.errors
        )
    }
}

/// Owns the work item store and translates work items to and from
/// transport entries.
///
/// Every status change goes through a conditional write against the tag
/// last read, so concurrent instances never move a record backwards.
pub struct Queue<Q, D> {
    transport: CategorizedQueueTransport<Q>,
    items: D,
    failed_items: D,
    settings: QueueSettings,
}

impl<Q, D> Queue<Q, D>
where
    Q: CloudQueue,
    D: PersistentDictionary,
{
    pub fn new(
        transport: CategorizedQueueTransport<Q>,
        items: D,
        failed_items: D,
        settings: QueueSettings,
    ) -> Self {
        Self {
            transport,
            items,
            failed_items,
            settings,
        }
    }

    /// Open both stores from `provider` and build the transport.
    pub async fn open<P>(
        cloud: Q,
        provider: &P,
        settings: QueueSettings,
        deployment: DeploymentIdentity,
    ) -> Result<Self, QueueError>
    where
        P: DictionaryProvider<Dictionary = D>,
    {
        let items = provider.open(&settings.work_item_store_name).await?;
        let failed_items = provider.open(&settings.failed_work_item_store_name).await?;
        let transport = CategorizedQueueTransport::new(cloud, &settings, deployment);
        info!(
            store = %settings.work_item_store_name,
            failed_store = %settings.failed_work_item_store_name,
            deployment = %transport.deployment().current,
            "Opened work item queue"
        );
        Ok(Self::new(transport, items, failed_items, settings))
    }

    pub fn transport(&self) -> &CategorizedQueueTransport<Q> {
        &self.transport
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Persist a new work item and queue it for processing.
    pub async fn enqueue_work_item(&self, mut item: WorkItem) -> Result<WorkItem, QueueError> {
        if item.status != WorkItemStatus::Queued {
            return Err(StatusError {
                id: item.id,
                from: item.status,
                to: WorkItemStatus::Queued,
            }
            .into());
        }
        item.queued_time.get_or_insert_with(Utc::now);

        match self.store(&item, WriteCondition::Absent).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(work_item_id = %item.id, "Work item already stored, enqueueing anyway");
            }
            Err(e) => return Err(e),
        }

        let entry = WorkItemQueueEntry::new(item.id, item.category.clone());
        self.transport.enqueue(&entry).await?;
        debug!(work_item_id = %item.id, category = %item.category, "Enqueued work item");
        Ok(item)
    }

    /// Persist a processed work item and route it to its result category.
    ///
    /// An existing record must not be terminal yet. The result entry is
    /// enqueued before the record is written, so a transport failure leaves
    /// the record retryable.
    pub async fn enqueue_processed_work_item(&self, item: WorkItem) -> Result<WorkItem, QueueError> {
        if item.status != WorkItemStatus::Processed {
            return Err(StatusError {
                id: item.id,
                from: item.status,
                to: WorkItemStatus::Processed,
            }
            .into());
        }

        let condition = match self.load(item.id).await? {
            Some((stored, etag)) => {
                if !stored.status.can_advance_to(WorkItemStatus::Processed) {
                    return Err(StatusError {
                        id: item.id,
                        from: stored.status,
                        to: WorkItemStatus::Processed,
                    }
                    .into());
                }
                WriteCondition::Matches(etag)
            }
            None => WriteCondition::Absent,
        };

        self.route_result(&item).await?;
        self.store(&item, condition).await?;
        Ok(item)
    }

    /// Lease up to `max_entries` work items of `category`.
    pub async fn dequeue_work_items(
        &self,
        category: &str,
        max_entries: usize,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let mut items = self.hydrate(category, max_entries).await?;
        let now = Utc::now();
        for item in &mut items {
            if !item.status.is_terminal() {
                item.dequeue_time.get_or_insert(now);
            }
        }
        Ok(items)
    }

    /// Lease up to `max_entries` results routed for `(result_type, source)`.
    pub async fn dequeue_processed_work_items(
        &self,
        result_type: ResultType,
        source: &str,
        max_entries: usize,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let Some(category) = result_type.result_category(source) else {
            return Ok(Vec::new());
        };
        self.hydrate(&category, max_entries).await
    }

    /// Delete the transport entry for `item`; the record stays for retention.
    ///
    /// Processed items are removed from their result channel, everything else
    /// from the work channel.
    pub async fn remove_from_queue(&self, item: &WorkItem) -> Result<bool, QueueError> {
        let category = if item.status == WorkItemStatus::Processed {
            item.result_category().ok_or(QueueError::Unroutable(item.id))?
        } else {
            item.category.clone()
        };
        self.transport
            .delete(&WorkItemQueueEntry::new(item.id, category))
            .await
    }

    /// Forget the lease on `item`'s work entry without deleting it; the entry
    /// becomes visible again once the lease runs out.
    pub fn release_work_item(&self, item: &WorkItem) -> bool {
        self.transport
            .release(&WorkItemQueueEntry::new(item.id, item.category.clone()))
    }

    /// Current record for `id`.
    pub async fn get_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        Ok(self.load(id).await?.map(|(item, _)| item))
    }

    /// Claim a leased item for processing.
    ///
    /// Returns `None` when the item should be skipped: the record is gone,
    /// it already finished (a redelivered entry, which is removed), or another
    /// instance updated it first.
    pub async fn begin_processing(&self, item: &WorkItem) -> Result<Option<WorkItem>, QueueError> {
        let Some((mut stored, etag)) = self.load(item.id).await? else {
            warn!(work_item_id = %item.id, "Work item record vanished before processing");
            self.transport
                .delete(&WorkItemQueueEntry::new(item.id, item.category.clone()))
                .await?;
            return Ok(None);
        };

        if stored.status.is_terminal() {
            info!(
                work_item_id = %stored.id,
                status = %stored.status,
                "Dropping redelivered entry for finished work item"
            );
            self.transport
                .delete(&WorkItemQueueEntry::new(stored.id, stored.category.clone()))
                .await?;
            return Ok(None);
        }

        stored.advance(WorkItemStatus::InProgress)?;
        let now = Utc::now();
        stored.dequeue_time = stored.dequeue_time.or(item.dequeue_time).or(Some(now));
        stored.processing_start_time.get_or_insert(now);

        match self.store(&stored, WriteCondition::Matches(etag)).await {
            Ok(_) => Ok(Some(stored)),
            Err(e) if e.is_conflict() => {
                debug!(work_item_id = %stored.id, "Work item claimed by another instance");
                self.release_work_item(&stored);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a successful processing run and acknowledge the work entry.
    ///
    /// Only `result` (and a terminal status, if the processor chose one) is
    /// taken from `output`; identity and routing come from the stored record.
    /// A chosen status must be `Failed` or the one the result type implies.
    ///
    /// Results are routed before the terminal status is written: if routing
    /// fails the record stays `InProgress` and the redelivered entry is
    /// processed again.
    pub async fn complete_processing(&self, output: WorkItem) -> Result<WorkItem, QueueError> {
        let (mut stored, etag) = self
            .load(output.id)
            .await?
            .ok_or(QueueError::NotFound(output.id))?;

        let expected = stored.success_status();
        let target = match output.status {
            status if !status.is_terminal() => expected,
            WorkItemStatus::Failed => WorkItemStatus::Failed,
            status if status == expected => status,
            status => {
                return Err(StatusError {
                    id: stored.id,
                    from: stored.status,
                    to: status,
                }
                .into());
            }
        };
        stored.advance(target)?;
        stored.result = output.result;
        finish(&mut stored, Utc::now());

        if stored.status == WorkItemStatus::Processed {
            self.route_result(&stored).await?;
        }
        self.store(&stored, WriteCondition::Matches(etag)).await?;
        self.acknowledge(&stored).await?;
        Ok(stored)
    }

    /// Mark the item `Failed` with `detail` and acknowledge the work entry.
    pub async fn fail_processing(
        &self,
        item: &WorkItem,
        detail: impl Into<String>,
    ) -> Result<WorkItem, QueueError> {
        let (mut stored, etag) = self
            .load(item.id)
            .await?
            .ok_or(QueueError::NotFound(item.id))?;

        stored.advance(WorkItemStatus::Failed)?;
        stored.result = Some(detail.into());
        finish(&mut stored, Utc::now());

        self.store(&stored, WriteCondition::Matches(etag)).await?;
        self.acknowledge(&stored).await?;
        Ok(stored)
    }

    /// Remove expired terminal work items, archiving failures first.
    pub async fn cleanup_work_items(&self) -> Result<CleanupReport, QueueError> {
        let retention = chrono::Duration::from_std(self.settings.work_item_retention_period())
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(CleanupReport::default());
        };

        let mut report = CleanupReport::default();
        for key in self.items.keys().await? {
            let Some(entry) = self.items.get(&key).await? else {
                continue;
            };
            report.scanned += 1;

            let item: WorkItem = match serde_json::from_value(entry.value.clone()) {
                Ok(item) => item,
                Err(err) => {
                    warn!(%key, error = %err, "Skipping undecodable work item record");
                    report.errors += 1;
                    continue;
                }
            };

            if item.is_expired(cutoff) {
                if item.status == WorkItemStatus::Failed {
                    self.failed_items
                        .set(&key, entry.value, WriteCondition::Any)
                        .await?;
                    report.archived_failures += 1;
                }
                if self.items.remove(&key).await? {
                    report.removed += 1;
                }
            } else if is_stale(&item, cutoff) {
                report.stale_in_progress += 1;
            }
        }

        if report.stale_in_progress > 0 {
            warn!(
                count = report.stale_in_progress,
                "Work items in progress longer than the retention period"
            );
        }
        info!(%report, "Work item cleanup finished");
        Ok(report)
    }

    async fn hydrate(&self, category: &str, max_entries: usize) -> Result<Vec<WorkItem>, QueueError> {
        let entries = self.transport.dequeue(category, max_entries).await?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.load(entry.work_item_id).await? {
                Some((item, _)) => items.push(item),
                None => {
                    warn!(
                        work_item_id = %entry.work_item_id,
                        category = %entry.category,
                        "Dropping queue entry without a work item record"
                    );
                    self.transport.delete(&entry).await?;
                }
            }
        }
        Ok(items)
    }

    async fn route_result(&self, item: &WorkItem) -> Result<(), QueueError> {
        let category = item.result_category().ok_or(QueueError::Unroutable(item.id))?;
        self.transport
            .enqueue(&WorkItemQueueEntry::new(item.id, category))
            .await
    }

    async fn acknowledge(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.transport
            .delete(&WorkItemQueueEntry::new(item.id, item.category.clone()))
            .await?;
        Ok(())
    }

    async fn load(&self, id: WorkItemId) -> Result<Option<(WorkItem, ETag)>, QueueError> {
        let Some(entry) = self.items.get(&id.to_string()).await? else {
            return Ok(None);
        };
        let item = serde_json::from_value(entry.value)?;
        Ok(Some((item, entry.etag)))
    }

    async fn store(&self, item: &WorkItem, condition: WriteCondition) -> Result<ETag, QueueError> {
        let value = serde_json::to_value(item)?;
        Ok(self.items.set(&item.id.to_string(), value, condition).await?)
    }
}

fn finish(item: &mut WorkItem, now: DateTime<Utc>) {
    item.processing_start_time.get_or_insert(now);
    item.processing_complete_time = Some(now);
}

fn is_stale(item: &WorkItem, cutoff: DateTime<Utc>) -> bool {
    item.status == WorkItemStatus::InProgress
        && item
            .processing_start_time
            .or(item.dequeue_time)
            .is_some_and(|started| started < cutoff)
}

#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, WarnCounter};
use queue_core::{
    PersistentDictionary, ResultType, WorkItem, WorkItemId, WorkItemQueueEntry, WorkItemStatus,
    WriteCondition,
};

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_unacknowledged_item_is_redelivered() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(Duration::from_millis(50));

    let item = queue
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "{\"id\":1}"))
        .await?;
    assert!(item.queued_time.is_some());

    let first = queue.dequeue_work_items("export", 10).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, item.id);
    assert!(first[0].dequeue_time.is_some());

    // Still leased
    assert!(queue.dequeue_work_items("export", 10).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let again = queue.dequeue_work_items("export", 10).await?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, item.id);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_dequeues_never_share_a_lease() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let producer = harness.queue(LEASE);
    let first = harness.queue(LEASE);
    let second = harness.queue(LEASE);

    for n in 0..5 {
        producer
            .enqueue_work_item(WorkItem::new("export", "tenant-a", n.to_string()))
            .await?;
    }

    let (a, b) = tokio::join!(
        first.dequeue_work_items("export", 3),
        second.dequeue_work_items("export", 3)
    );
    let (a, b) = (a?, b?);
    assert_eq!(a.len() + b.len(), 5);
    for item in &a {
        assert!(b.iter().all(|other| other.id != item.id));
    }
    Ok(())
}

#[tokio::test]
async fn test_status_only_moves_forward() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    let item = queue
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "payload"))
        .await?;
    let stored = queue.get_work_item(item.id).await?.ok_or("missing")?;
    assert_eq!(stored.status, WorkItemStatus::Queued);

    let leased = queue.dequeue_work_items("export", 1).await?.remove(0);
    let claimed = queue.begin_processing(&leased).await?.ok_or("not claimed")?;
    assert_eq!(claimed.status, WorkItemStatus::InProgress);
    assert!(claimed.processing_start_time.is_some());

    let mut output = claimed.clone();
    output.result = Some("R".to_string());
    let done = queue.complete_processing(output).await?;
    assert_eq!(done.status, WorkItemStatus::Processed);
    assert_eq!(done.result.as_deref(), Some("R"));
    assert!(done.processing_complete_time >= done.processing_start_time);

    // Terminal records reject further transitions
    let late = queue.fail_processing(&claimed, "too late").await;
    assert!(late.is_err());
    let stored = queue.get_work_item(item.id).await?.ok_or("missing")?;
    assert_eq!(stored.status, WorkItemStatus::Processed);
    assert_eq!(stored.result.as_deref(), Some("R"));

    // A redelivered entry for a finished item is skipped
    assert!(queue.begin_processing(&claimed).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_completion_routes_result_and_acknowledges() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    queue
        .enqueue_work_item(
            WorkItem::new("export", "tenant-a", "payload").with_result_type(ResultType::PerSource),
        )
        .await?;
    let leased = queue.dequeue_work_items("export", 1).await?.remove(0);
    let claimed = queue.begin_processing(&leased).await?.ok_or("not claimed")?;
    queue.complete_processing(claimed).await?;

    assert_eq!(harness.cloud.message_count("test-export"), 0);
    assert_eq!(harness.cloud.message_count("test-results-tenant-a"), 1);

    let results = queue
        .dequeue_processed_work_items(ResultType::PerSource, "tenant-a", 5)
        .await?;
    assert_eq!(results.len(), 1);
    assert!(queue.remove_from_queue(&results[0]).await?);
    assert_eq!(harness.cloud.message_count("test-results-tenant-a"), 0);
    Ok(())
}

#[tokio::test]
async fn test_discarded_results_complete_without_routing() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    queue
        .enqueue_work_item(
            WorkItem::new("export", "tenant-a", "payload").with_result_type(ResultType::Discard),
        )
        .await?;
    let leased = queue.dequeue_work_items("export", 1).await?.remove(0);
    let claimed = queue.begin_processing(&leased).await?.ok_or("not claimed")?;
    let done = queue.complete_processing(claimed).await?;

    assert_eq!(done.status, WorkItemStatus::Completed);
    assert_eq!(harness.cloud.channels(), vec!["test-export".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_result_routing_by_source() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    let mut private = WorkItem::new("export", "tenant-a", "p").with_result_type(ResultType::PerSource);
    private.status = WorkItemStatus::Processed;
    queue.enqueue_processed_work_item(private.clone()).await?;

    let mut shared = WorkItem::new("export", "tenant-b", "s");
    shared.status = WorkItemStatus::Processed;
    queue.enqueue_processed_work_item(shared.clone()).await?;

    let other = queue
        .dequeue_processed_work_items(ResultType::PerSource, "tenant-b", 10)
        .await?;
    assert!(other.is_empty());

    let mine = queue
        .dequeue_processed_work_items(ResultType::PerSource, "tenant-a", 10)
        .await?;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, private.id);

    let any = queue
        .dequeue_processed_work_items(ResultType::Shared, "someone-else", 10)
        .await?;
    assert_eq!(any.len(), 1);
    assert_eq!(any[0].id, shared.id);

    // Only processed items may be routed
    let queued = WorkItem::new("export", "tenant-a", "q");
    assert!(queue.enqueue_processed_work_item(queued).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_respects_retention() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);
    let old = Utc::now() - chrono::Duration::days(8);
    let recent = Utc::now() - chrono::Duration::hours(1);

    let seed = |status: WorkItemStatus, started, completed| {
        let mut item = WorkItem::new("export", "tenant-a", "x");
        item.status = status;
        item.processing_start_time = started;
        item.processing_complete_time = completed;
        item
    };
    let failed = seed(WorkItemStatus::Failed, Some(old), Some(old));
    let completed = seed(WorkItemStatus::Completed, Some(old), Some(old));
    let fresh = seed(WorkItemStatus::Processed, Some(recent), Some(recent));
    let stuck = seed(WorkItemStatus::InProgress, Some(old), None);

    for item in [&failed, &completed, &fresh, &stuck] {
        harness
            .items
            .set(&item.id.to_string(), serde_json::to_value(item)?, WriteCondition::Absent)
            .await?;
    }

    let report = queue.cleanup_work_items().await?;
    assert_eq!(report.scanned, 4);
    assert_eq!(report.removed, 2);
    assert_eq!(report.archived_failures, 1);
    assert_eq!(report.stale_in_progress, 1);

    assert!(!harness.items.contains_key(&failed.id.to_string()).await?);
    assert!(!harness.items.contains_key(&completed.id.to_string()).await?);
    assert!(harness.items.contains_key(&fresh.id.to_string()).await?);
    assert!(harness.items.contains_key(&stuck.id.to_string()).await?);

    let archived = harness
        .failed_items
        .get(&failed.id.to_string())
        .await?
        .ok_or("failed item not archived")?;
    let archived: WorkItem = serde_json::from_value(archived.value)?;
    assert_eq!(archived, failed);
    assert_eq!(harness.failed_items.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_without_receipt_warns_once() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let producer = harness.queue(LEASE);
    let other = harness.queue(LEASE);

    let item = producer
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "x"))
        .await?;

    let warnings = WarnCounter::default();
    let removed = {
        let _guard = warnings.install();
        other.remove_from_queue(&item).await?
    };

    assert!(!removed);
    assert_eq!(warnings.count(), 1);
    assert_eq!(harness.cloud.message_count("test-export"), 1);
    assert_eq!(other.transport().pending_receipts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_entry_without_record_is_dropped() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    let orphan = WorkItemQueueEntry::new(WorkItemId::new(), "export");
    queue.transport().enqueue(&orphan).await?;
    let kept = queue
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "x"))
        .await?;

    let warnings = WarnCounter::default();
    let items = {
        let _guard = warnings.install();
        queue.dequeue_work_items("export", 10).await?
    };

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, kept.id);
    assert_eq!(warnings.count(), 1);
    // The orphan entry was deleted, the real one is still leased
    assert_eq!(harness.cloud.message_count("test-export"), 1);
    Ok(())
}

#[tokio::test]
async fn test_enqueue_survives_channel_deletion() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    queue
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "1"))
        .await?;
    assert!(harness.cloud.delete_channel("test-export"));

    harness.cloud.fail_next(2);
    queue
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "2"))
        .await?;
    assert_eq!(harness.cloud.message_count("test-export"), 1);
    Ok(())
}

#[tokio::test]
async fn test_result_is_routed_after_transport_outage() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(Duration::from_millis(50));

    let item = queue
        .enqueue_work_item(
            WorkItem::new("export", "tenant-a", "payload").with_result_type(ResultType::Shared),
        )
        .await?;
    let leased = queue.dequeue_work_items("export", 1).await?.remove(0);
    let claimed = queue.begin_processing(&leased).await?.ok_or("not claimed")?;
    let mut output = claimed.clone();
    output.result = Some("R".to_string());

    // Every attempt to create the result channel fails
    harness.cloud.fail_next(4);
    let err = queue.complete_processing(output.clone()).await.unwrap_err();
    assert!(err.is_fatal());
    let stored = queue.get_work_item(item.id).await?.ok_or("missing")?;
    assert_eq!(stored.status, WorkItemStatus::InProgress);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let redelivered = queue.dequeue_work_items("export", 1).await?;
    assert_eq!(redelivered.len(), 1);
    let reclaimed = queue
        .begin_processing(&redelivered[0])
        .await?
        .ok_or("redelivered item not reclaimed")?;
    assert_eq!(reclaimed.status, WorkItemStatus::InProgress);

    let done = queue.complete_processing(output).await?;
    assert_eq!(done.status, WorkItemStatus::Processed);
    let results = queue
        .dequeue_processed_work_items(ResultType::Shared, "anyone", 5)
        .await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result.as_deref(), Some("R"));
    assert_eq!(harness.cloud.message_count("test-export"), 0);
    Ok(())
}

#[tokio::test]
async fn test_processed_enqueue_never_rewrites_finished_items() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    let item = queue
        .enqueue_work_item(WorkItem::new("export", "tenant-a", "payload"))
        .await?;
    let leased = queue.dequeue_work_items("export", 1).await?.remove(0);
    let claimed = queue.begin_processing(&leased).await?.ok_or("not claimed")?;
    queue.fail_processing(&claimed, "broken input").await?;

    let mut rewritten = claimed.clone();
    rewritten.status = WorkItemStatus::Processed;
    rewritten.result = Some("rewritten".to_string());
    let err = queue.enqueue_processed_work_item(rewritten).await.unwrap_err();
    assert!(matches!(err, workqueue::QueueError::Status(_)));

    let stored = queue.get_work_item(item.id).await?.ok_or("missing")?;
    assert_eq!(stored.status, WorkItemStatus::Failed);
    assert_eq!(stored.result.as_deref(), Some("broken input"));
    assert_eq!(harness.cloud.channels(), vec!["test-export".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_completion_status_must_match_result_type() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new();
    let queue = harness.queue(LEASE);

    for (result_type, chosen) in [
        (ResultType::Discard, WorkItemStatus::Processed),
        (ResultType::PerSource, WorkItemStatus::Completed),
    ] {
        let item = queue
            .enqueue_work_item(WorkItem::new("export", "tenant-a", "x").with_result_type(result_type))
            .await?;
        let leased = queue.dequeue_work_items("export", 1).await?.remove(0);
        let mut output = queue.begin_processing(&leased).await?.ok_or("not claimed")?;
        output.status = chosen;

        let err = queue.complete_processing(output.clone()).await.unwrap_err();
        assert!(matches!(err, workqueue::QueueError::Status(_)));
        let stored = queue.get_work_item(item.id).await?.ok_or("missing")?;
        assert_eq!(stored.status, WorkItemStatus::InProgress);

        // Still leased, so the item can be failed and acknowledged
        let failed = queue.fail_processing(&output, err.to_string()).await?;
        assert_eq!(failed.status, WorkItemStatus::Failed);
    }
    assert_eq!(harness.cloud.message_count("test-export"), 0);
    assert_eq!(harness.cloud.channels(), vec!["test-export".to_string()]);
    Ok(())
}

//! Runs a queue processor against the configured backends until ctrl-c.
//!
//! `WORKITEM_STORE_BACKEND` picks where work item records live:
//! `memory` (default), `surreal` or `blob`. The transport is the in-process
//! queue, so the host seeds a few demo items on startup.

use std::error::Error;
use std::sync::Arc;

use processor::{ProcessingError, ProcessorRegistry, QueueProcessor, work_item_processor};
use queue_core::{
    DeploymentIdentity, DictionaryProvider, MemoryCloudQueue, MemoryDictionaryProvider,
    ProcessorSettings, QueueSettings, ResultType, WorkItem,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use workqueue::Queue;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let processor_settings = ProcessorSettings::from_env()?;
    processor_settings.validate()?;
    let queue_settings = QueueSettings::from_env()?;
    let deployment = DeploymentIdentity::from_env();

    let backend = std::env::var("WORKITEM_STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());
    tracing::info!(%backend, deployment = %deployment.current, "Starting work item host");

    match backend.as_str() {
        "memory" => {
            run(MemoryDictionaryProvider::new(), queue_settings, processor_settings, deployment).await
        }
        "surreal" => {
            let provider = db::open_provider(&db::DbConfig::from_env()).await?;
            run(provider, queue_settings, processor_settings, deployment).await
        }
        "blob" => {
            let provider = storage::BlobDictionaryProvider::from_env().await?;
            tracing::info!(kind = provider.kind().as_str(), "Using blob storage");
            run(provider, queue_settings, processor_settings, deployment).await
        }
        other => Err(format!("unknown WORKITEM_STORE_BACKEND {other:?}, expected memory, surreal or blob").into()),
    }
}

async fn run<P: DictionaryProvider>(
    provider: P,
    queue_settings: QueueSettings,
    processor_settings: ProcessorSettings,
    deployment: DeploymentIdentity,
) -> Result<(), Box<dyn Error>> {
    let queue = Queue::open(MemoryCloudQueue::new(), &provider, queue_settings, deployment).await?;
    let queue = Arc::new(queue);

    let registry = demo_registry();
    seed_demo_items(&queue).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let processor = QueueProcessor::new(queue, registry.categories(), registry, processor_settings);
    processor.run(cancel).await?;
    Ok(())
}

fn demo_registry() -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();

    // Demo: Echo processor
    registry.register(
        "echo",
        work_item_processor!(|item| {
            tracing::info!(work_item_id = %item.id, content = %item.content, "Echo work item");
            let mut item = item;
            item.result = Some(item.content.clone());
            Ok(item)
        }),
    );

    // Demo: Reverse processor, rejects empty content
    registry.register(
        "reverse",
        work_item_processor!(|item| {
            if item.content.is_empty() {
                Err(ProcessingError::recoverable("nothing to reverse"))
            } else {
                let mut item = item;
                item.result = Some(item.content.chars().rev().collect());
                Ok(item)
            }
        }),
    );

    registry
}

async fn seed_demo_items<D: queue_core::PersistentDictionary>(
    queue: &Queue<MemoryCloudQueue, D>,
) -> Result<(), Box<dyn Error>> {
    let items = [
        WorkItem::new("echo", "demo", "hello"),
        WorkItem::new("echo", "demo", "discarded").with_result_type(ResultType::Discard),
        WorkItem::new("reverse", "demo", "stressed").with_result_type(ResultType::PerSource),
        WorkItem::new("reverse", "demo", ""),
    ];
    for item in items {
        let item = queue.enqueue_work_item(item).await?;
        tracing::info!(work_item_id = %item.id, category = %item.category, "Seeded demo work item");
    }
    Ok(())
}

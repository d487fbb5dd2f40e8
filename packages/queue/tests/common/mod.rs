use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use queue_core::{
    DeploymentIdentity, MemoryCloudQueue, MemoryDictionary, QueueSettings,
};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use workqueue::{CategorizedQueueTransport, Queue};

pub type MemoryQueue = Queue<MemoryCloudQueue, MemoryDictionary>;

/// Handles onto the backing fakes so tests can inspect them.
pub struct Harness {
    pub cloud: MemoryCloudQueue,
    pub items: MemoryDictionary,
    pub failed_items: MemoryDictionary,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cloud: MemoryCloudQueue::new(),
            items: MemoryDictionary::new(),
            failed_items: MemoryDictionary::new(),
        }
    }

    /// Another queue instance over the same transport and stores.
    pub fn queue(&self, visibility_timeout: Duration) -> MemoryQueue {
        let settings = QueueSettings {
            retry_delay_ms: 1,
            ..Default::default()
        };
        let transport = CategorizedQueueTransport::new(
            self.cloud.clone(),
            &settings,
            DeploymentIdentity::new("test"),
        )
        .with_visibility_timeout(visibility_timeout);
        Queue::new(
            transport,
            self.items.clone(),
            self.failed_items.clone(),
            settings,
        )
    }
}

/// Counts WARN events emitted while installed.
#[derive(Clone, Default)]
pub struct WarnCounter(Arc<AtomicUsize>);

impl WarnCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(Registry::default().with(self.clone()))
    }
}

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

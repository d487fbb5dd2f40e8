use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use processor::QueueProcessorStats;
use queue_core::{
    DeploymentIdentity, MemoryCloudQueue, MemoryDictionary, PersistentDictionary,
    ProcessorSettings, QueueSettings, WorkItem, WorkItemId,
};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use workqueue::{CategorizedQueueTransport, Queue};

pub type MemoryQueue = Queue<MemoryCloudQueue, MemoryDictionary>;

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

    pub fn queue(&self) -> Arc<MemoryQueue> {
        let settings = QueueSettings {
            retry_delay_ms: 1,
            ..Default::default()
        };
        let transport = CategorizedQueueTransport::new(
            self.cloud.clone(),
            &settings,
            DeploymentIdentity::new("test"),
        );
        Arc::new(Queue::new(
            transport,
            self.items.clone(),
            self.failed_items.clone(),
            settings,
        ))
    }

    pub async fn stored(&self, id: WorkItemId) -> WorkItem {
        let entry = self
            .items
            .get(&id.to_string())
            .await
            .unwrap()
            .expect("work item record");
        serde_json::from_value(entry.value).unwrap()
    }
}

/// Short waits so idle loops stay cheap in tests.
pub fn fast_settings() -> ProcessorSettings {
    ProcessorSettings {
        min_queue_poll_wait_ms: 5,
        max_queue_poll_wait_ms: 20,
        inactive_queue_poll_wait_ms: 20,
        ..Default::default()
    }
}

/// Resolves once `done` holds for the stats, or panics after two seconds.
pub async fn wait_for(stats: &QueueProcessorStats, done: impl Fn(&QueueProcessorStats) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done(stats) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("processor did not reach the expected state");
}

/// Counts WARN and ERROR events emitted while installed, and keeps every
/// event message.
#[derive(Clone, Default)]
pub struct LevelCounter {
    warnings: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    messages: Arc<Mutex<Vec<String>>>,
}

impl LevelCounter {
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn saw(&self, message: &str) -> bool {
        self.messages.lock().unwrap().iter().any(|m| m == message)
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(Registry::default().with(self.clone()))
    }
}

impl<S: Subscriber> Layer<S> for LevelCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::WARN => {
                self.warnings.fetch_add(1, Ordering::SeqCst);
            }
            Level::ERROR => {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        let mut message = None;
        event.record(&mut MessageVisitor(&mut message));
        if let Some(message) = message {
            self.messages.lock().unwrap().push(message);
        }
    }
}

struct MessageVisitor<'a>(&'a mut Option<String>);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{value:?}"));
        }
    }
}

//! Work item processor trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use queue_core::WorkItem;
use thiserror::Error;

/// Whether a processing failure should stop the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Only this work item failed; keep going.
    Recoverable,
    /// Stop the processor after recording the failure.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Recoverable => write!(f, "recoverable"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error returned by a [`WorkItemProcessor`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} processing error: {message}")]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProcessingError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }
}

/// Result type for work item processors.
pub type ProcessResult = Result<WorkItem, ProcessingError>;

/// Future type for async work item processors.
pub type ProcessFuture = Pin<Box<dyn Future<Output = ProcessResult> + Send>>;

/// Trait for work item processors.
///
/// A processor takes the claimed work item and returns it with `result` set.
/// Leaving `status` untouched lets the queue pick the success status from the
/// item's result type.
pub trait WorkItemProcessor: Send + Sync + 'static {
    /// Process a work item and return the updated item.
    fn process(&self, item: WorkItem) -> ProcessFuture;
}

impl<P: WorkItemProcessor + ?Sized> WorkItemProcessor for Arc<P> {
    fn process(&self, item: WorkItem) -> ProcessFuture {
        (**self).process(item)
    }
}

/// A simple function-based processor.
pub struct FnProcessor<F>
where
    F: Fn(WorkItem) -> ProcessFuture + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(WorkItem) -> ProcessFuture + Send + Sync + 'static,
{
    /// Create a new function-based processor.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> WorkItemProcessor for FnProcessor<F>
where
    F: Fn(WorkItem) -> ProcessFuture + Send + Sync + 'static,
{
    fn process(&self, item: WorkItem) -> ProcessFuture {
        (self.handler)(item)
    }
}

/// Helper macro for creating processors from async closures.
#[macro_export]
macro_rules! work_item_processor {
    (|$item:ident| $body:expr) => {
        $crate::FnProcessor::new(|$item: $crate::WorkItem| {
            Box::pin(async move {
                let result: $crate::ProcessResult = $body;
                result
            })
        })
    };
}

/// Registry of processors keyed by work item category.
///
/// The registry is itself a processor: it dispatches on `item.category` and
/// fails items of unknown categories without stopping the loop.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn WorkItemProcessor>>,
}

impl ProcessorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a category.
    pub fn register<P: WorkItemProcessor>(&mut self, category: impl Into<String>, processor: P) {
        self.processors.insert(category.into(), Arc::new(processor));
    }

    /// Get the processor for a category.
    pub fn get(&self, category: &str) -> Option<Arc<dyn WorkItemProcessor>> {
        self.processors.get(category).cloned()
    }

    /// Check if a processor exists for a category.
    pub fn has_processor(&self, category: &str) -> bool {
        self.processors.contains_key(category)
    }

    /// All registered categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.processors.keys().cloned().collect();
        categories.sort();
        categories
    }
}

impl WorkItemProcessor for ProcessorRegistry {
    fn process(&self, item: WorkItem) -> ProcessFuture {
        match self.get(&item.category) {
            Some(processor) => processor.process(item),
            None => {
                let message = format!("no processor registered for category {}", item.category);
                Box::pin(async move { ProcessResult::Err(ProcessingError::recoverable(message)) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper() -> impl WorkItemProcessor {
        crate::work_item_processor!(|item| {
            let mut item = item;
            item.result = Some(item.content.to_uppercase());
            Ok(item)
        })
    }

    #[tokio::test]
    async fn registry_dispatches_by_category() {
        let mut registry = ProcessorRegistry::new();
        registry.register("upper", upper());
        assert!(registry.has_processor("upper"));
        assert_eq!(registry.categories(), vec!["upper".to_string()]);

        let done = registry
            .process(WorkItem::new("upper", "tenant-a", "abc"))
            .await
            .unwrap();
        assert_eq!(done.result.as_deref(), Some("ABC"));

        let err = registry
            .process(WorkItem::new("unknown", "tenant-a", "abc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Recoverable);
    }

    #[test]
    fn error_kind_is_tagged() {
        assert!(ProcessingError::fatal("stop").is_fatal());
        assert!(!ProcessingError::recoverable("retry later").is_fatal());
        assert_eq!(
            ProcessingError::fatal("stop").to_string(),
            "fatal processing error: stop"
        );
    }
}

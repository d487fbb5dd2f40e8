//! Per-category processing statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::WorkItem;

/// Count, min, max and mean of a set of durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl LatencySummary {
    pub fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(sample);
        self.min = Some(self.min.map_or(sample, |min| min.min(sample)));
        self.max = Some(self.max.map_or(sample, |max| max.max(sample)));
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.count).ok().filter(|count| *count > 0)?;
        Some(self.total / count)
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.mean(), self.max) {
            (Some(min), Some(mean), Some(max)) => write!(
                f,
                "n={} min={}ms mean={}ms max={}ms",
                self.count,
                min.as_millis(),
                mean.as_millis(),
                max.as_millis()
            ),
            _ => write!(f, "n=0"),
        }
    }
}

/// Counters for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub dequeued: u64,
    pub processed: u64,
    pub failed: u64,
    /// `dequeue_time - queued_time`
    pub queue_latency: LatencySummary,
    /// `processing_complete_time - processing_start_time`
    pub processing_latency: LatencySummary,
}

/// Point-in-time copy of [`QueueProcessorStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub start_time: DateTime<Utc>,
    pub categories: BTreeMap<String, CategoryStats>,
}

impl StatsSnapshot {
    pub fn category(&self, category: &str) -> CategoryStats {
        self.categories.get(category).copied().unwrap_or_default()
    }

    pub fn totals(&self) -> CategoryStats {
        self.categories
            .values()
            .fold(CategoryStats::default(), |mut acc, stats| {
                acc.dequeued += stats.dequeued;
                acc.processed += stats.processed;
                acc.failed += stats.failed;
                acc
            })
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let totals = self.totals();
        write!(
            f,
            "since {}: dequeued={} processed={} failed={}",
            self.start_time.to_rfc3339(),
            totals.dequeued,
            totals.processed,
            totals.failed
        )?;
        for (category, stats) in &self.categories {
            write!(
                f,
                "\n  {category}: dequeued={} processed={} failed={} queue_latency[{}] processing_latency[{}]",
                stats.dequeued,
                stats.processed,
                stats.failed,
                stats.queue_latency,
                stats.processing_latency
            )?;
        }
        Ok(())
    }
}

/// Thread-safe accumulator, shared between the loop and whoever logs it.
#[derive(Debug)]
pub struct QueueProcessorStats {
    start_time: DateTime<Utc>,
    categories: Mutex<BTreeMap<String, CategoryStats>>,
}

impl Default for QueueProcessorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueProcessorStats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            categories: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn update(&self, category: &str, apply: impl FnOnce(&mut CategoryStats)) {
        let mut categories = self
            .categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        apply(categories.entry(category.to_string()).or_default());
    }

    /// Count a dequeued item and sample its queue latency.
    pub fn record_dequeued(&self, item: &WorkItem) {
        let latency = item.queue_latency().and_then(|d| d.to_std().ok());
        self.update(&item.category, |stats| {
            stats.dequeued += 1;
            if let Some(latency) = latency {
                stats.queue_latency.record(latency);
            }
        });
    }

    pub fn record_processed(&self, item: &WorkItem) {
        let latency = item.processing_latency().and_then(|d| d.to_std().ok());
        self.update(&item.category, |stats| {
            stats.processed += 1;
            if let Some(latency) = latency {
                stats.processing_latency.record(latency);
            }
        });
    }

    pub fn record_failed(&self, item: &WorkItem) {
        let latency = item.processing_latency().and_then(|d| d.to_std().ok());
        self.update(&item.category, |stats| {
            stats.failed += 1;
            if let Some(latency) = latency {
                stats.processing_latency.record(latency);
            }
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let categories = self
            .categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        StatsSnapshot {
            start_time: self.start_time,
            categories,
        }
    }
}

impl fmt::Display for QueueProcessorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed_item(category: &str, queued_ms: i64, processing_ms: i64) -> WorkItem {
        let base = Utc::now();
        let mut item = WorkItem::new(category, "tenant-a", "{}");
        item.queued_time = Some(base);
        item.dequeue_time = Some(base + chrono::Duration::milliseconds(queued_ms));
        item.processing_start_time = item.dequeue_time;
        item.processing_complete_time =
            Some(base + chrono::Duration::milliseconds(queued_ms + processing_ms));
        item
    }

    #[test]
    fn aggregates_per_category() {
        let stats = QueueProcessorStats::new();
        let fast = timed_item("export", 10, 20);
        let slow = timed_item("export", 30, 60);
        let other = timed_item("import", 5, 5);

        for item in [&fast, &slow, &other] {
            stats.record_dequeued(item);
        }
        stats.record_processed(&fast);
        stats.record_failed(&slow);
        stats.record_processed(&other);

        let snapshot = stats.snapshot();
        let export = snapshot.category("export");
        assert_eq!((export.dequeued, export.processed, export.failed), (2, 1, 1));
        assert_eq!(export.queue_latency.min, Some(Duration::from_millis(10)));
        assert_eq!(export.queue_latency.max, Some(Duration::from_millis(30)));
        assert_eq!(export.queue_latency.mean(), Some(Duration::from_millis(20)));
        assert_eq!(export.processing_latency.count, 2);
        assert_eq!(export.processing_latency.mean(), Some(Duration::from_millis(40)));

        assert_eq!(snapshot.totals().dequeued, 3);
        assert_eq!(snapshot.category("missing"), CategoryStats::default());
    }

    #[test]
    fn summary_lists_categories() {
        let stats = QueueProcessorStats::new();
        stats.record_dequeued(&timed_item("export", 10, 10));
        let summary = stats.to_string();
        assert!(summary.contains("dequeued=1"));
        assert!(summary.contains("export:"));
        assert_eq!(LatencySummary::default().to_string(), "n=0");
    }
}

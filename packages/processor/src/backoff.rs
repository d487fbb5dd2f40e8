//! Idle backoff, warning escalation and periodic task timing.
//!
//! All three take `now` explicitly so the schedules can be checked without
//! sleeping.

use std::time::{Duration, Instant};

use queue_core::ProcessorSettings;

/// Wait schedule between empty polls.
///
/// Empty polls wait `min`, `min * b`, `min * b^2`, ... capped at `max`; once
/// the queue has been idle longer than the inactivity threshold, the wait is
/// pinned to the inactive wait.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    factor: f64,
    inactive_after: Duration,
    inactive_wait: Duration,
    current: Duration,
    idle_since: Option<Instant>,
}

impl PollBackoff {
    pub fn new(settings: &ProcessorSettings) -> Self {
        let min = settings.min_queue_poll_wait();
        Self {
            min,
            max: settings.max_queue_poll_wait().max(min),
            factor: settings.queue_poll_backoff.max(1.0),
            inactive_after: settings.inactive_queue_time(),
            inactive_wait: settings.inactive_queue_poll_wait(),
            current: min,
            idle_since: None,
        }
    }

    /// Work arrived: start over from the minimum wait.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.idle_since = None;
    }

    /// Wait to apply after an empty poll observed at `now`.
    pub fn next_wait(&mut self, now: Instant) -> Duration {
        let idle_since = *self.idle_since.get_or_insert(now);
        if now.saturating_duration_since(idle_since) > self.inactive_after {
            return self.inactive_wait;
        }

        let wait = self.current;
        let grown = self.current.as_nanos() as f64 * self.factor;
        let capped = grown.min(self.max.as_nanos() as f64);
        self.current = Duration::from_nanos(capped as u64);
        wait
    }

    /// How long the queue has been idle as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.idle_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }
}

/// Counts warnings and reports when too many land inside one window.
#[derive(Debug, Clone)]
pub struct WarningTracker {
    max_warnings: u32,
    window: Duration,
    count: u32,
    window_start: Option<Instant>,
}

impl WarningTracker {
    pub fn new(max_warnings: u32, window: Duration) -> Self {
        Self {
            max_warnings: max_warnings.max(1),
            window,
            count: 0,
            window_start: None,
        }
    }

    /// Record one warning at `now`.
    ///
    /// Returns `true` when this warning reaches the limit; the count then
    /// starts over.
    pub fn record(&mut self, now: Instant) -> bool {
        let expired = self
            .window_start
            .is_none_or(|start| now.saturating_duration_since(start) > self.window);
        if expired {
            self.window_start = Some(now);
            self.count = 0;
        }

        self.count += 1;
        if self.count >= self.max_warnings {
            self.count = 0;
            self.window_start = None;
            return true;
        }
        false
    }

    /// A clean cycle breaks the run of warnings.
    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Fires once per interval.
///
/// An interval too long to represent as an `Instant` never fires.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    every: Duration,
    next_due: Option<Instant>,
}

impl PeriodicTask {
    /// First run is one interval after `now`.
    pub fn new(every: Duration, now: Instant) -> Self {
        Self {
            every,
            next_due: now.checked_add(every),
        }
    }

    /// Whether the task should run at `now`; if so, schedule the next run.
    pub fn is_due(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = now.checked_add(self.every);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            min_queue_poll_wait_ms: 100,
            max_queue_poll_wait_ms: 600,
            queue_poll_backoff: 2.0,
            inactive_queue_time_ms: 1000,
            inactive_queue_poll_wait_ms: 600,
            ..Default::default()
        }
    }

    #[test]
    fn idle_schedule_grows_then_caps_then_pins() {
        let mut backoff = PollBackoff::new(&settings());
        let start = Instant::now();

        let mut elapsed = 0;
        let mut waits = Vec::new();
        for _ in 0..7 {
            let wait = backoff.next_wait(start + ms(elapsed));
            elapsed += wait.as_millis() as u64;
            waits.push(wait.as_millis() as u64);
        }
        assert_eq!(waits, vec![100, 200, 400, 600, 600, 600, 600]);

        // Idle 1300 ms by the fifth poll: pinned regardless of the curve.
        assert!(backoff.idle_for(start + ms(1300)) > ms(1000));
        assert_eq!(backoff.next_wait(start + ms(5000)), ms(600));
    }

    #[test]
    fn pinned_wait_differs_from_cap_once_inactive() {
        let mut backoff = PollBackoff::new(&ProcessorSettings {
            inactive_queue_poll_wait_ms: 5000,
            ..settings()
        });
        let start = Instant::now();
        assert_eq!(backoff.next_wait(start), ms(100));
        assert_eq!(backoff.next_wait(start + ms(100)), ms(200));
        assert_eq!(backoff.next_wait(start + ms(1001)), ms(5000));
    }

    #[test]
    fn reset_restarts_from_minimum() {
        let mut backoff = PollBackoff::new(&settings());
        let start = Instant::now();
        backoff.next_wait(start);
        backoff.next_wait(start + ms(100));
        backoff.reset();
        assert_eq!(backoff.idle_for(start + ms(500)), Duration::ZERO);
        assert_eq!(backoff.next_wait(start + ms(2000)), ms(100));
    }

    #[test]
    fn warnings_escalate_within_window() {
        let mut tracker = WarningTracker::new(3, ms(1000));
        let start = Instant::now();
        assert!(!tracker.record(start));
        assert!(!tracker.record(start + ms(10)));
        assert!(tracker.record(start + ms(20)));
        assert_eq!(tracker.count(), 0);

        // Spread out beyond the window: never escalates
        assert!(!tracker.record(start + ms(100)));
        assert!(!tracker.record(start + ms(1200)));
        assert!(!tracker.record(start + ms(2400)));
    }

    #[test]
    fn success_breaks_a_run_of_warnings() {
        let mut tracker = WarningTracker::new(3, ms(1000));
        let start = Instant::now();
        assert!(!tracker.record(start));
        assert!(!tracker.record(start + ms(10)));
        tracker.reset();
        assert_eq!(tracker.count(), 0);
        assert!(!tracker.record(start + ms(20)));
        assert!(!tracker.record(start + ms(30)));
        assert!(tracker.record(start + ms(40)));
    }

    #[test]
    fn unrepresentable_interval_never_fires() {
        let start = Instant::now();
        let mut task = PeriodicTask::new(Duration::MAX, start);
        assert!(!task.is_due(start));
        assert!(!task.is_due(start + Duration::from_secs(365 * 24 * 3600)));

        let mut task = PeriodicTask::new(Duration::from_secs(u64::MAX), start);
        assert!(!task.is_due(start + ms(1)));
    }

    #[test]
    fn periodic_task_fires_once_per_interval() {
        let start = Instant::now();
        let mut task = PeriodicTask::new(ms(100), start);
        assert!(!task.is_due(start + ms(50)));
        assert!(task.is_due(start + ms(100)));
        assert!(!task.is_due(start + ms(150)));
        assert!(task.is_due(start + ms(250)));
    }
}

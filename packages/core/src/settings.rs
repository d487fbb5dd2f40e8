//! Queue and processor configuration, injected at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest lease the transport grants.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid value for {name}={value}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Which deployment this process belongs to.
///
/// Producers write to the active deployment when one is designated, so a new
/// deployment can take over traffic while the old one drains its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentIdentity {
    pub current: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

impl DeploymentIdentity {
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            active: None,
        }
    }

    /// Designate the deployment producers should target.
    pub fn with_active(mut self, active: impl Into<String>) -> Self {
        self.active = Some(active.into());
        self
    }

    /// Deployment that receives new messages.
    pub fn enqueue_target(&self) -> &str {
        self.active.as_deref().unwrap_or(&self.current)
    }

    /// Read `DEPLOYMENT_ID` (default `local`) and `ACTIVE_DEPLOYMENT_ID`.
    pub fn from_env() -> Self {
        let current = env_string("DEPLOYMENT_ID").unwrap_or_else(|| "local".to_string());
        Self {
            current,
            active: env_string("ACTIVE_DEPLOYMENT_ID"),
        }
    }
}

impl Default for DeploymentIdentity {
    fn default() -> Self {
        Self::new("local")
    }
}

/// Settings for the queue orchestrator and its transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Store holding every work item record.
    pub work_item_store_name: String,
    /// Store retaining failed work items past normal retention.
    pub failed_work_item_store_name: String,
    /// How long terminal work items are kept before cleanup.
    pub work_item_retention_period_secs: u64,
    /// Transport lease duration.
    pub visibility_timeout_secs: u64,
    /// Retries for transient transport failures.
    pub enqueue_retries: u32,
    /// Fixed delay between transport retries.
    pub retry_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            work_item_store_name: "workitems".to_string(),
            failed_work_item_store_name: "failedworkitems".to_string(),
            work_item_retention_period_secs: 7 * 24 * 60 * 60,
            visibility_timeout_secs: MAX_VISIBILITY_TIMEOUT.as_secs(),
            enqueue_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl QueueSettings {
    pub fn work_item_retention_period(&self) -> Duration {
        Duration::from_secs(self.work_item_retention_period_secs)
    }

    /// Requested lease duration, before the transport clamps it.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Build settings from environment variables, falling back to defaults.
    ///
    /// - `QUEUE_WORK_ITEM_STORE_NAME`, `QUEUE_FAILED_WORK_ITEM_STORE_NAME`
    /// - `QUEUE_WORK_ITEM_RETENTION_SECS`
    /// - `QUEUE_VISIBILITY_TIMEOUT_SECS`
    /// - `QUEUE_ENQUEUE_RETRIES`, `QUEUE_RETRY_DELAY_MS`
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();
        Ok(Self {
            work_item_store_name: env_string("QUEUE_WORK_ITEM_STORE_NAME")
                .unwrap_or(defaults.work_item_store_name),
            failed_work_item_store_name: env_string("QUEUE_FAILED_WORK_ITEM_STORE_NAME")
                .unwrap_or(defaults.failed_work_item_store_name),
            work_item_retention_period_secs: env_parse("QUEUE_WORK_ITEM_RETENTION_SECS")?
                .unwrap_or(defaults.work_item_retention_period_secs),
            visibility_timeout_secs: env_parse("QUEUE_VISIBILITY_TIMEOUT_SECS")?
                .unwrap_or(defaults.visibility_timeout_secs),
            enqueue_retries: env_parse("QUEUE_ENQUEUE_RETRIES")?
                .unwrap_or(defaults.enqueue_retries),
            retry_delay_ms: env_parse("QUEUE_RETRY_DELAY_MS")?.unwrap_or(defaults.retry_delay_ms),
        })
    }
}

/// Settings for the polling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Wait after the first empty poll.
    pub min_queue_poll_wait_ms: u64,
    /// Ceiling for the idle backoff.
    pub max_queue_poll_wait_ms: u64,
    /// Multiplier applied to the wait after each empty poll.
    pub queue_poll_backoff: f64,
    /// Idle time after which the wait is pinned.
    pub inactive_queue_time_ms: u64,
    /// Wait used once the queue counts as inactive.
    pub inactive_queue_poll_wait_ms: u64,
    /// Maximum work items taken per poll, across all categories.
    pub max_poll_batch_size: usize,
    pub work_item_cleanup_frequency_secs: u64,
    pub log_stats_frequency_secs: u64,
    /// Warnings tolerated within `warning_wait_secs` before alerting.
    pub max_warnings: u32,
    pub warning_wait_secs: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            min_queue_poll_wait_ms: 100,
            max_queue_poll_wait_ms: 30_000,
            queue_poll_backoff: 2.0,
            inactive_queue_time_ms: 10 * 60 * 1000,
            inactive_queue_poll_wait_ms: 60_000,
            max_poll_batch_size: 16,
            work_item_cleanup_frequency_secs: 60 * 60,
            log_stats_frequency_secs: 5 * 60,
            max_warnings: 5,
            warning_wait_secs: 10 * 60,
        }
    }
}

impl ProcessorSettings {
    pub fn min_queue_poll_wait(&self) -> Duration {
        Duration::from_millis(self.min_queue_poll_wait_ms)
    }

    pub fn max_queue_poll_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_poll_wait_ms)
    }

    pub fn inactive_queue_time(&self) -> Duration {
        Duration::from_millis(self.inactive_queue_time_ms)
    }

    pub fn inactive_queue_poll_wait(&self) -> Duration {
        Duration::from_millis(self.inactive_queue_poll_wait_ms)
    }

    pub fn work_item_cleanup_frequency(&self) -> Duration {
        Duration::from_secs(self.work_item_cleanup_frequency_secs)
    }

    pub fn log_stats_frequency(&self) -> Duration {
        Duration::from_secs(self.log_stats_frequency_secs)
    }

    pub fn warning_wait(&self) -> Duration {
        Duration::from_secs(self.warning_wait_secs)
    }

    /// Build settings from `QUEUE_PROCESSOR_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        let d = Self::default();
        let settings = Self {
            min_queue_poll_wait_ms: env_parse("QUEUE_PROCESSOR_MIN_POLL_WAIT_MS")?
                .unwrap_or(d.min_queue_poll_wait_ms),
            max_queue_poll_wait_ms: env_parse("QUEUE_PROCESSOR_MAX_POLL_WAIT_MS")?
                .unwrap_or(d.max_queue_poll_wait_ms),
            queue_poll_backoff: env_parse("QUEUE_PROCESSOR_POLL_BACKOFF")?
                .unwrap_or(d.queue_poll_backoff),
            inactive_queue_time_ms: env_parse("QUEUE_PROCESSOR_INACTIVE_TIME_MS")?
                .unwrap_or(d.inactive_queue_time_ms),
            inactive_queue_poll_wait_ms: env_parse("QUEUE_PROCESSOR_INACTIVE_POLL_WAIT_MS")?
                .unwrap_or(d.inactive_queue_poll_wait_ms),
            max_poll_batch_size: env_parse("QUEUE_PROCESSOR_MAX_POLL_BATCH_SIZE")?
                .unwrap_or(d.max_poll_batch_size),
            work_item_cleanup_frequency_secs: env_parse("QUEUE_PROCESSOR_CLEANUP_FREQUENCY_SECS")?
                .unwrap_or(d.work_item_cleanup_frequency_secs),
            log_stats_frequency_secs: env_parse("QUEUE_PROCESSOR_LOG_STATS_FREQUENCY_SECS")?
                .unwrap_or(d.log_stats_frequency_secs),
            max_warnings: env_parse("QUEUE_PROCESSOR_MAX_WARNINGS")?.unwrap_or(d.max_warnings),
            warning_wait_secs: env_parse("QUEUE_PROCESSOR_WARNING_WAIT_SECS")?
                .unwrap_or(d.warning_wait_secs),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject schedules the loop cannot follow.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.queue_poll_backoff.is_finite() || self.queue_poll_backoff < 1.0 {
            return Err(invalid(
                "queue_poll_backoff",
                self.queue_poll_backoff,
                "must be a finite number >= 1",
            ));
        }
        if self.max_queue_poll_wait_ms < self.min_queue_poll_wait_ms {
            return Err(invalid(
                "max_queue_poll_wait_ms",
                self.max_queue_poll_wait_ms,
                "must not be below min_queue_poll_wait_ms",
            ));
        }
        if self.max_poll_batch_size == 0 {
            return Err(invalid("max_poll_batch_size", 0, "must be positive"));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_string(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, SettingsError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(name, &raw, &e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ProcessorSettings::default().validate().is_ok());
        assert_eq!(
            QueueSettings::default().visibility_timeout(),
            MAX_VISIBILITY_TIMEOUT
        );
    }

    #[test]
    fn backoff_below_one_is_rejected() {
        let settings = ProcessorSettings {
            queue_poll_backoff: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { name, .. }) if name == "queue_poll_backoff"
        ));
    }

    #[test]
    fn enqueue_target_prefers_active_deployment() {
        let identity = DeploymentIdentity::new("blue");
        assert_eq!(identity.enqueue_target(), "blue");
        let identity = identity.with_active("green");
        assert_eq!(identity.enqueue_target(), "green");
        assert_eq!(identity.current, "blue");
    }

    #[test]
    fn partial_settings_deserialize_with_defaults() {
        let settings: QueueSettings =
            serde_json::from_str(r#"{"enqueue_retries": 7}"#).unwrap();
        assert_eq!(settings.enqueue_retries, 7);
        assert_eq!(settings.work_item_store_name, "workitems");
    }
}

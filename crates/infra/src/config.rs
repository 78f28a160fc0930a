//! Configuration loading and representation.

use std::time::Duration;

use uuid::Uuid;

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Connection URL for the backing log store.
    pub redis_url: String,
    /// Prefix for stream keys (e.g. `meridian:events` → `meridian:events:market`).
    pub stream_prefix: String,
    /// How many entries a consume loop reads per iteration.
    pub default_read_count: usize,
    /// How long a consume loop blocks waiting for new entries.
    pub default_block_ms: u64,
    /// Pause after a transient read error before retrying.
    pub error_pause_ms: u64,
    /// Approximate retention cap applied to appends (None = unbounded).
    pub max_stream_len: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_prefix: "meridian:events".to_string(),
            default_read_count: 10,
            default_block_ms: 1000,
            error_pause_ms: 1000,
            max_stream_len: Some(100_000),
        }
    }
}

impl BusConfig {
    /// Load from the environment, falling back to defaults field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env_or("MERIDIAN_REDIS_URL", defaults.redis_url),
            stream_prefix: env_or("MERIDIAN_STREAM_PREFIX", defaults.stream_prefix),
            default_read_count: env_parsed("MERIDIAN_READ_COUNT", defaults.default_read_count),
            default_block_ms: env_parsed("MERIDIAN_BLOCK_MS", defaults.default_block_ms),
            error_pause_ms: env_parsed("MERIDIAN_ERROR_PAUSE_MS", defaults.error_pause_ms),
            max_stream_len: defaults.max_stream_len,
        }
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    pub fn with_max_stream_len(mut self, max_len: Option<usize>) -> Self {
        self.max_stream_len = max_len;
        self
    }
}

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Global cap on concurrently executing tasks.
    pub max_concurrent: usize,
    /// Constant deferral applied when the cap is reached (not the task's own
    /// backoff policy).
    pub backpressure_delay: Duration,
    /// Interval between `system.service.health` publications.
    pub health_interval: Duration,
    /// Consumer name within the task-queue group; unique per process so
    /// workers sharing the group compete for distinct messages.
    pub consumer_name: String,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            backpressure_delay: Duration::from_millis(100),
            health_interval: Duration::from_secs(30),
            consumer_name: format!("worker-{}", Uuid::now_v7()),
        }
    }
}

impl TaskQueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: env_parsed("MERIDIAN_MAX_CONCURRENT_TASKS", defaults.max_concurrent),
            backpressure_delay: Duration::from_millis(env_parsed(
                "MERIDIAN_BACKPRESSURE_DELAY_MS",
                defaults.backpressure_delay.as_millis() as u64,
            )),
            health_interval: Duration::from_secs(env_parsed(
                "MERIDIAN_HEALTH_INTERVAL_SECS",
                defaults.health_interval.as_secs(),
            )),
            consumer_name: env_or("MERIDIAN_CONSUMER_NAME", defaults.consumer_name),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: core::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable env override; using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let bus = BusConfig::default();
        assert!(bus.default_read_count > 0);
        assert!(bus.default_block_ms > 0);

        let tasks = TaskQueueConfig::default();
        assert!(tasks.max_concurrent > 0);
        assert!(tasks.consumer_name.starts_with("worker-"));
    }

    #[test]
    fn consumer_names_are_unique_per_process_instance() {
        assert_ne!(
            TaskQueueConfig::default().consumer_name,
            TaskQueueConfig::default().consumer_name
        );
    }
}

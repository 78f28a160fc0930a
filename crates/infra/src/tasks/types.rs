//! Core task types and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use meridian_core::{CorrelationId, TaskId, UserId};

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base × 2^(attempt-1)
    Exponential,
    /// base × attempt
    Linear,
    /// base
    Fixed,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration. Pure value type; clone freely across tasks of
/// the same policy class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fixed delays, no jitter.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: false,
        }
    }

    /// Exponential backoff with a cap.
    pub fn exponential(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms,
            max_delay_ms,
            jitter: true,
        }
    }

    /// Delay before retry `attempt` (1-indexed).
    ///
    /// Strategy result is clamped to `max_delay_ms`; jitter then adds a
    /// deterministic pseudo-random amount of up to 10% of the clamped delay,
    /// floored to whole milliseconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;

        let raw = match self.backoff {
            BackoffStrategy::Exponential => base * 2_f64.powi((attempt - 1) as i32),
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Fixed => base,
        };
        let clamped = raw.min(max);

        let jitter = if self.jitter {
            // Deterministic pseudo-random in [0, 1); keeps retry timing
            // reproducible under test.
            let r = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            clamped * 0.1 * r
        } else {
            0.0
        };

        Duration::from_millis((clamped + jitter) as u64)
    }
}

/// A unit of deferred, retryable work dispatched through the task queue.
///
/// Serialized as the `data` payload of `task.queued` / `task.retry` /
/// `task.schedule` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub task_type: String,
    pub payload: JsonValue,
    pub priority: Priority,
    /// Retries after the initial attempt; a task with `max_retries = 2` runs
    /// at most 3 times.
    pub max_retries: u32,
    pub retry: RetryConfig,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the task may execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl TaskDefinition {
    pub fn new(task_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            priority: Priority::default(),
            max_retries: 3,
            retry: RetryConfig::default(),
            created_at: Utc::now(),
            scheduled_for: None,
            user_id: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn correlated(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Whether the task may execute now.
    pub fn is_ready(&self) -> bool {
        match self.scheduled_for {
            Some(at) => Utc::now() >= at,
            None => true,
        }
    }
}

/// Outcome of one task's execution chain. Ephemeral: surfaced via
/// logs/stats, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub retry_count: u32,
}

/// Aggregate counters snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub running: usize,
}

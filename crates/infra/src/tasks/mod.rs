//! Background task system on top of the event bus.
//!
//! ## Design
//!
//! - Tasks are typed; one handler per task type
//! - Queueing publishes a `task.queued` event and returns immediately
//! - Retry policy with exponential/linear/fixed backoff, local to one
//!   execution (a task occupies one bus message for its whole lifetime)
//! - Global concurrency cap enforced by deferral, never by blocking the
//!   consume loop
//! - Periodic `system.service.health` publication with counters
//!
//! ## Components
//!
//! - `TaskDefinition` / `TaskResult` / `RetryConfig`: value types
//! - `TaskQueue`: subscription, dispatch, bounded execution, stats
//! - Domain wrappers: thin builders over `queue_task`

pub mod queue;
pub mod types;
pub mod wrappers;

pub use queue::{TASK_QUEUE_GROUP, TaskHandler, TaskQueue, TaskQueueError};
pub use types::{BackoffStrategy, Priority, RetryConfig, TaskDefinition, TaskResult, TaskStats};

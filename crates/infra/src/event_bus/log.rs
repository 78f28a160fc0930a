//! Stream-log store contract.
//!
//! The bus consumes a durable, ordered, partition-by-stream log with
//! consumer-group cursor tracking. It does not design one: this trait is the
//! boundary, Redis Streams is the production implementation, and an in-memory
//! log with the same semantics backs tests and local development.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use meridian_events::Stream;

/// Failure at the log-store boundary.
#[derive(Debug, Error, Clone)]
pub enum LogError {
    #[error("log connection error: {0}")]
    Connection(String),

    #[error("log command error: {0}")]
    Command(String),

    /// The store cannot serve this operation (e.g. pending-entry
    /// enumeration). Callers treat this as "feature absent", not as a fault.
    #[error("operation not supported by this log store")]
    Unsupported,
}

/// One stored entry: the store-assigned id plus the flat field map.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// A delivered-but-unacknowledged entry, as reported by the store.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// Outcome of consumer-group creation. Pre-existing groups are not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreated {
    Created,
    AlreadyExists,
}

/// Read-only stream introspection.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub length: u64,
    pub last_id: String,
    pub groups: u64,
}

/// Read-only consumer-group introspection.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

/// Contract the external log store must satisfy.
///
/// Semantics the bus relies on:
/// - `append` is durable and ordered within a stream.
/// - `read_group` returns only entries not yet delivered to the group (`>`
///   semantics), blocking up to `block_ms` when none are available; an entry
///   is delivered to exactly one consumer of the group and stays pending
///   until acknowledged.
/// - `create_group` is idempotent via the [`GroupCreated`] result.
pub trait StreamLog: Send + Sync {
    /// Establish connections. Called once by the bus on connect.
    fn connect(&self) -> Result<(), LogError>;

    /// Tear down connections. Outstanding blocking reads finish their
    /// current timeout.
    fn disconnect(&self);

    /// Durably append; returns the store-assigned message id. `max_len`
    /// applies the stream's approximate retention cap.
    fn append(
        &self,
        stream: Stream,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, LogError>;

    /// Create a consumer group at `start_id` (`"0"` = full history, `"$"` =
    /// new entries only), creating the stream if missing.
    fn create_group(&self, stream: Stream, group: &str, start_id: &str)
    -> Result<GroupCreated, LogError>;

    /// Read up to `count` new entries for `(group, consumer)`, blocking up to
    /// `block_ms`. An empty result after the timeout is not an error.
    fn read_group(
        &self,
        stream: Stream,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogError>;

    /// Acknowledge one entry for a group.
    fn ack(&self, stream: Stream, group: &str, id: &str) -> Result<(), LogError>;

    /// Enumerate delivered-but-unacknowledged entries for a group.
    /// Best-effort: stores may return [`LogError::Unsupported`].
    fn pending(&self, stream: Stream, group: &str) -> Result<Vec<PendingEntry>, LogError>;

    /// Fetch a single entry by id (used by dead-letter reclaim).
    fn read_one(&self, stream: Stream, id: &str) -> Result<Option<LogEntry>, LogError>;

    fn stream_info(&self, stream: Stream) -> Result<StreamInfo, LogError>;

    fn group_info(&self, stream: Stream) -> Result<Vec<GroupInfo>, LogError>;
}

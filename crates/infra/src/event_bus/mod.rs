//! Event bus over an external ordered log.
//!
//! The envelope/schema mechanics live in `meridian-events`; this module owns
//! the transport side: the [`StreamLog`] store contract, its Redis Streams
//! and in-memory implementations, and the [`EventBus`] orchestrator
//! (consumer groups, consume loops, correlation waiting, dead-letter
//! recovery).

pub mod bus;
pub mod log;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use bus::{BusError, EventBus, EventHandler, HandlerVerdict, PublishOptions, SubscribeOptions};
pub use log::{GroupCreated, GroupInfo, LogEntry, LogError, PendingEntry, StreamInfo, StreamLog};
pub use memory::InMemoryLog;
#[cfg(feature = "redis")]
pub use redis_streams::RedisLog;

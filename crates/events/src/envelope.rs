use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use meridian_core::{CorrelationId, EventId, UserId};

use crate::stream::Stream;

/// Envelope for an event: identity, routing and audit metadata around an
/// opaque payload.
///
/// This is the unit you publish/append to an event stream.
///
/// Notes:
/// - **Immutable**: fields are set at construction and never mutated. A retry
///   produces a *new* envelope, not a changed one.
/// - `id` is time-sortable (UUIDv7), monotonic within process clock
///   resolution.
/// - `data` is schema-validated at publish time but opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EventId,
    stream: Stream,
    event_type: String,
    version: u32,
    timestamp: DateTime<Utc>,
    correlation_id: Option<CorrelationId>,
    user_id: Option<UserId>,
    data: JsonValue,
    metadata: HashMap<String, String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(stream: Stream, event_type: impl Into<String>, version: u32, data: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            stream,
            event_type: event_type.into(),
            version,
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
            data,
            metadata: HashMap::new(),
        }
    }

    /// Reassemble an envelope from its constituent parts.
    ///
    /// Used by the wire codec; prefer [`Envelope::new`] everywhere else so ids
    /// and timestamps are assigned consistently.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: EventId,
        stream: Stream,
        event_type: impl Into<String>,
        version: u32,
        timestamp: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
        user_id: Option<UserId>,
        data: JsonValue,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            stream,
            event_type: event_type.into(),
            version,
            timestamp,
            correlation_id,
            user_id,
            data,
            metadata,
        }
    }

    /// Attach a correlation id linking this event to a causal chain.
    pub fn correlated(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach the originating actor.
    pub fn from_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attach one auxiliary metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }
}

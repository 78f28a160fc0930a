//! Event schema registry and publish-time validation.
//!
//! Every event type the platform emits is registered here with its stream,
//! current schema revision, and the required top-level fields of the payload.
//! Publishing an unregistered type fails; so does a payload missing a
//! required field. The registry is intentionally a flat static table: schema
//! evolution bumps `version` and adjusts the field list in one place.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::stream::Stream;

/// Registered shape of one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSchema {
    pub event_type: &'static str,
    pub stream: Stream,
    pub version: u32,
    /// Top-level fields the payload object must carry.
    pub required: &'static [&'static str],
}

/// All event types known to the platform.
pub const EVENT_SCHEMAS: &[EventSchema] = &[
    EventSchema {
        event_type: "user.registered",
        stream: Stream::User,
        version: 1,
        required: &["email"],
    },
    EventSchema {
        event_type: "user.profile.updated",
        stream: Stream::User,
        version: 1,
        required: &["fields"],
    },
    EventSchema {
        event_type: "content.generated",
        stream: Stream::Content,
        version: 1,
        required: &["content_id", "content_type"],
    },
    EventSchema {
        event_type: "content.file.processed",
        stream: Stream::Content,
        version: 1,
        required: &["file_id", "status"],
    },
    EventSchema {
        event_type: "market.data.collected",
        stream: Stream::Market,
        version: 1,
        required: &["symbols"],
    },
    EventSchema {
        event_type: "market.alert.triggered",
        stream: Stream::Market,
        version: 1,
        required: &["symbol", "condition"],
    },
    EventSchema {
        event_type: "ai.consultation.completed",
        stream: Stream::Ai,
        version: 1,
        required: &["consultation_id"],
    },
    EventSchema {
        event_type: "ai.embedding.generated",
        stream: Stream::Ai,
        version: 1,
        required: &["source_id"],
    },
    EventSchema {
        event_type: "notification.dispatched",
        stream: Stream::Notification,
        version: 1,
        required: &["channel", "recipient"],
    },
    EventSchema {
        event_type: "system.service.health",
        stream: Stream::System,
        version: 1,
        required: &["service", "status"],
    },
    EventSchema {
        event_type: "task.queued",
        stream: Stream::System,
        version: 1,
        required: &["id", "task_type", "payload"],
    },
    EventSchema {
        event_type: "task.retry",
        stream: Stream::System,
        version: 1,
        required: &["id", "task_type", "payload"],
    },
    EventSchema {
        event_type: "task.schedule",
        stream: Stream::System,
        version: 1,
        required: &["id", "task_type", "payload"],
    },
    EventSchema {
        event_type: "task.failed",
        stream: Stream::System,
        version: 1,
        required: &["id", "task_type", "error"],
    },
];

/// Schema-level failure, surfaced at publish time.
///
/// Both variants are caller-recoverable: fix the event type or payload and
/// publish again. Nothing has been appended when these are returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("schema validation failed for {event_type}: {reason}")]
    SchemaValidation { event_type: String, reason: String },
}

/// Look up the registered schema for an event type.
pub fn schema_for(event_type: &str) -> Option<&'static EventSchema> {
    EVENT_SCHEMAS.iter().find(|s| s.event_type == event_type)
}

/// Validate an envelope against the registry.
///
/// Checks that the type is registered and that the payload is an object
/// carrying every required field. The payload is otherwise opaque.
pub fn validate(envelope: &Envelope) -> Result<(), SchemaError> {
    let schema = schema_for(envelope.event_type())
        .ok_or_else(|| SchemaError::UnknownEventType(envelope.event_type().to_string()))?;

    validate_payload(schema, envelope.data())
}

fn validate_payload(schema: &EventSchema, data: &JsonValue) -> Result<(), SchemaError> {
    let object = data.as_object().ok_or_else(|| SchemaError::SchemaValidation {
        event_type: schema.event_type.to_string(),
        reason: "payload is not an object".to_string(),
    })?;

    for field in schema.required {
        if !object.contains_key(*field) {
            return Err(SchemaError::SchemaValidation {
                event_type: schema.event_type.to_string(),
                reason: format!("missing required field: {field}"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_type_is_rejected() {
        let env = Envelope::new(Stream::User, "user.deleted", 1, json!({}));
        assert_eq!(
            validate(&env),
            Err(SchemaError::UnknownEventType("user.deleted".to_string()))
        );
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let env = Envelope::new(Stream::Market, "market.alert.triggered", 1, json!({"symbol": "NVDA"}));
        let err = validate(&env).unwrap_err();
        assert!(matches!(err, SchemaError::SchemaValidation { .. }));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let env = Envelope::new(Stream::Market, "market.data.collected", 1, json!("symbols"));
        let err = validate(&env).unwrap_err();
        assert!(matches!(err, SchemaError::SchemaValidation { .. }));
    }

    #[test]
    fn valid_payload_passes() {
        let env = Envelope::new(
            Stream::Notification,
            "notification.dispatched",
            1,
            json!({"channel": "email", "recipient": "ops@example.com"}),
        );
        assert_eq!(validate(&env), Ok(()));
    }

    #[test]
    fn registry_streams_are_consistent() {
        // Every task.* schema rides the system stream; the dispatcher relies
        // on that when it subscribes.
        for schema in EVENT_SCHEMAS.iter().filter(|s| s.event_type.starts_with("task.")) {
            assert_eq!(schema.stream, Stream::System);
        }
    }
}

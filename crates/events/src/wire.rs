//! Wire codec: envelope ↔ flat string field map.
//!
//! The log store speaks flat field maps (one string value per field), so the
//! envelope is flattened on append and reassembled on read. Absent optional
//! fields serialize to the empty string and deserialize back to absent, so
//! `unmarshal(marshal(e))` reproduces `e` exactly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use meridian_core::{CorrelationId, EventId, UserId};

use crate::envelope::Envelope;
use crate::stream::Stream;

pub const FIELD_ID: &str = "id";
pub const FIELD_STREAM: &str = "stream";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_CORRELATION_ID: &str = "correlation_id";
pub const FIELD_USER_ID: &str = "user_id";
pub const FIELD_DATA: &str = "data";
pub const FIELD_METADATA: &str = "metadata";

/// Failure reassembling an envelope from stored fields.
///
/// A message that fails to unmarshal is left un-acknowledged so the store's
/// pending-entry redelivery can retry it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("missing wire field: {0}")]
    MissingField(&'static str),

    #[error("malformed wire field {field}: {reason}")]
    MalformedField { field: &'static str, reason: String },
}

fn malformed(field: &'static str, reason: impl ToString) -> WireError {
    WireError::MalformedField {
        field,
        reason: reason.to_string(),
    }
}

/// Flatten an envelope into ordered `(field, value)` pairs for appending.
pub fn marshal(envelope: &Envelope) -> Vec<(String, String)> {
    let correlation = envelope
        .correlation_id()
        .map(|c| c.to_string())
        .unwrap_or_default();
    let user = envelope.user_id().map(|u| u.to_string()).unwrap_or_default();

    vec![
        (FIELD_ID.to_string(), envelope.id().to_string()),
        (FIELD_STREAM.to_string(), envelope.stream().as_str().to_string()),
        (FIELD_TYPE.to_string(), envelope.event_type().to_string()),
        (FIELD_VERSION.to_string(), envelope.version().to_string()),
        (FIELD_TIMESTAMP.to_string(), envelope.timestamp().to_rfc3339()),
        (FIELD_CORRELATION_ID.to_string(), correlation),
        (FIELD_USER_ID.to_string(), user),
        (FIELD_DATA.to_string(), envelope.data().to_string()),
        (
            FIELD_METADATA.to_string(),
            serde_json::to_string(envelope.metadata()).unwrap_or_else(|_| "{}".to_string()),
        ),
    ]
}

/// Reassemble an envelope from the stored field map.
pub fn unmarshal(fields: &HashMap<String, String>) -> Result<Envelope, WireError> {
    let id: EventId = required(fields, FIELD_ID)?
        .parse()
        .map_err(|e| malformed(FIELD_ID, e))?;

    let stream: Stream = required(fields, FIELD_STREAM)?
        .parse()
        .map_err(|e| malformed(FIELD_STREAM, e))?;

    let event_type = required(fields, FIELD_TYPE)?;

    let version: u32 = required(fields, FIELD_VERSION)?
        .parse()
        .map_err(|e| malformed(FIELD_VERSION, e))?;

    let timestamp = DateTime::parse_from_rfc3339(required(fields, FIELD_TIMESTAMP)?)
        .map_err(|e| malformed(FIELD_TIMESTAMP, e))?
        .with_timezone(&Utc);

    let correlation_id = optional::<CorrelationId>(fields, FIELD_CORRELATION_ID)?;
    let user_id = optional::<UserId>(fields, FIELD_USER_ID)?;

    let data = serde_json::from_str(required(fields, FIELD_DATA)?)
        .map_err(|e| malformed(FIELD_DATA, e))?;

    let metadata: HashMap<String, String> = serde_json::from_str(required(fields, FIELD_METADATA)?)
        .map_err(|e| malformed(FIELD_METADATA, e))?;

    Ok(Envelope::from_parts(
        id,
        stream,
        event_type,
        version,
        timestamp,
        correlation_id,
        user_id,
        data,
        metadata,
    ))
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str, WireError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(WireError::MissingField(name))
}

fn optional<T>(fields: &HashMap<String, String>, name: &'static str) -> Result<Option<T>, WireError>
where
    T: core::str::FromStr,
    T::Err: ToString,
{
    match fields.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|e| malformed(name, e)),
    }
}

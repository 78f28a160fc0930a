//! The fixed set of event streams.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// A named, append-only ordered log partition for one category of events.
///
/// The set is closed: every envelope belongs to exactly one of these streams,
/// and the bus eagerly creates the default consumer group for each of them on
/// connect.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Account lifecycle and profile events.
    User,
    /// Generated content and file-processing events.
    Content,
    /// Market data collection and alerting events.
    Market,
    /// AI consultation and embedding events.
    Ai,
    /// Outbound notification events.
    Notification,
    /// Service health and task-dispatch events.
    System,
}

impl Stream {
    pub const ALL: [Stream; 6] = [
        Stream::User,
        Stream::Content,
        Stream::Market,
        Stream::Ai,
        Stream::Notification,
        Stream::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::User => "user",
            Stream::Content => "content",
            Stream::Market => "market",
            Stream::Ai => "ai",
            Stream::Notification => "notification",
            Stream::System => "system",
        }
    }
}

impl core::fmt::Display for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized stream name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stream: {0}")]
pub struct UnknownStream(pub String);

impl FromStr for Stream {
    type Err = UnknownStream;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Stream::User),
            "content" => Ok(Stream::Content),
            "market" => Ok(Stream::Market),
            "ai" => Ok(Stream::Ai),
            "notification" => Ok(Stream::Notification),
            "system" => Ok(Stream::System),
            other => Err(UnknownStream(other.to_string())),
        }
    }
}

//! Event mechanics: streams, envelopes, schemas, wire codec.
//!
//! This crate is **pure mechanics**: it knows nothing about the transport.
//! The durable log and the publish/subscribe orchestration live in
//! `meridian-infra`; everything here is deterministic and IO-free.

pub mod envelope;
pub mod schema;
pub mod stream;
pub mod wire;

pub use envelope::Envelope;
pub use schema::{EventSchema, SchemaError, schema_for, validate};
pub use stream::{Stream, UnknownStream};
pub use wire::{WireError, marshal, unmarshal};

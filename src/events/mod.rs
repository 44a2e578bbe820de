//! Typed domain events and their wire envelope.
//!
//! Every message on the bus is a JSON envelope: header fields (`event_id`,
//! `event_type`, `timestamp`, `source`, `version`, `correlation_id`) at the
//! top level and a kind-specific object under `payload`. The header kind and
//! the payload variant are tied together by [`EventPayload::kind`], so an
//! [`Envelope`] can never carry a mismatched pair.

pub mod codec;
pub mod envelope;
pub mod models;
pub mod topics;

pub use codec::{DecodeError, EncodeError, EventCodec};
pub use envelope::{Envelope, EventHeader, EventKind, EventPayload};
pub use models::{
    AlertPayload, ArbitrageLeg, Bookmaker, ErrorPayload, Fork, HealthCheckPayload, Market,
    MarketType, Match, Odds, Outcome, SportType,
};
pub use topics::{Topic, PROTOCOL_VERSION};

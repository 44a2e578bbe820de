//! Event envelope: header plus typed payload.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{AlertPayload, ErrorPayload, Fork, HealthCheckPayload, Match, Odds};

/// Closed set of event kinds; the wire tag is the `event_type` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "match.found")]
    MatchFound,
    #[serde(rename = "odds.updated")]
    OddsUpdated,
    #[serde(rename = "fork.found")]
    ForkFound,
    #[serde(rename = "alert.created")]
    AlertCreated,
    #[serde(rename = "health.check")]
    HealthCheck,
    #[serde(rename = "error")]
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MatchFound => "match.found",
            EventKind::OddsUpdated => "odds.updated",
            EventKind::ForkFound => "fork.found",
            EventKind::AlertCreated => "alert.created",
            EventKind::HealthCheck => "health.check",
            EventKind::Error => "error",
        }
    }

    /// Parse a wire tag, `None` for tags this build does not know.
    pub fn from_tag(tag: &str) -> Option<EventKind> {
        match tag {
            "match.found" => Some(EventKind::MatchFound),
            "odds.updated" => Some(EventKind::OddsUpdated),
            "fork.found" => Some(EventKind::ForkFound),
            "alert.created" => Some(EventKind::AlertCreated),
            "health.check" => Some(EventKind::HealthCheck),
            "error" => Some(EventKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and provenance metadata shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: String,
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Typed payload, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    MatchFound(Match),
    OddsUpdated(Odds),
    ForkFound(Fork),
    AlertCreated(AlertPayload),
    HealthCheck(HealthCheckPayload),
    Error(ErrorPayload),
}

impl EventPayload {
    /// The kind this payload must be tagged with.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::MatchFound(_) => EventKind::MatchFound,
            EventPayload::OddsUpdated(_) => EventKind::OddsUpdated,
            EventPayload::ForkFound(_) => EventKind::ForkFound,
            EventPayload::AlertCreated(_) => EventKind::AlertCreated,
            EventPayload::HealthCheck(_) => EventKind::HealthCheck,
            EventPayload::Error(_) => EventKind::Error,
        }
    }

    /// Deserialize a payload for a given kind from a JSON value.
    pub(crate) fn from_value(
        kind: EventKind,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::MatchFound => EventPayload::MatchFound(serde_json::from_value(value)?),
            EventKind::OddsUpdated => EventPayload::OddsUpdated(serde_json::from_value(value)?),
            EventKind::ForkFound => EventPayload::ForkFound(serde_json::from_value(value)?),
            EventKind::AlertCreated => EventPayload::AlertCreated(serde_json::from_value(value)?),
            EventKind::HealthCheck => EventPayload::HealthCheck(serde_json::from_value(value)?),
            EventKind::Error => EventPayload::Error(serde_json::from_value(value)?),
        })
    }
}

/// An immutable event: header plus payload whose kinds always agree.
///
/// Envelopes are only produced by [`EventCodec`](super::EventCodec), either
/// freshly built for publishing or decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    header: EventHeader,
    payload: EventPayload,
}

impl Envelope {
    /// Caller guarantees `header.event_type == payload.kind()`.
    pub(crate) fn from_parts(header: EventHeader, payload: EventPayload) -> Self {
        debug_assert_eq!(header.event_type, payload.kind());
        Self { header, payload }
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn kind(&self) -> EventKind {
        self.header.event_type
    }

    pub fn event_id(&self) -> &str {
        &self.header.event_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header.correlation_id.as_deref()
    }

    pub fn into_parts(self) -> (EventHeader, EventPayload) {
        (self.header, self.payload)
    }
}

/// Wire layout: header fields flattened at the top level, payload nested.
#[derive(Serialize)]
pub(crate) struct WireEnvelopeRef<'a> {
    #[serde(flatten)]
    pub header: &'a EventHeader,
    pub payload: &'a EventPayload,
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEnvelopeRef {
            header: &self.header,
            payload: &self.payload,
        }
        .serialize(serializer)
    }
}

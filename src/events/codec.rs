//! JSON envelope codec.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::envelope::{Envelope, EventHeader, EventKind, EventPayload};
use super::topics::PROTOCOL_VERSION;

/// Errors raised while encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Failed to serialize {kind} event: {source}")]
    Serialize {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while decoding an envelope. Decoding never has side effects.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown event type '{0}'")]
    UnknownKind(String),

    #[error("Expected {expected} event, got {actual}")]
    KindMismatch {
        expected: EventKind,
        actual: EventKind,
    },

    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Header as it arrives on the wire, before the kind tag is validated.
#[derive(Deserialize)]
struct RawEnvelope {
    event_id: String,
    event_type: String,
    timestamp: DateTime<Utc>,
    source: String,
    version: String,
    #[serde(default)]
    correlation_id: Option<String>,
    payload: serde_json::Value,
}

/// Builds, serializes and parses event envelopes for one source service.
#[derive(Debug, Clone)]
pub struct EventCodec {
    source: String,
    version: String,
}

impl EventCodec {
    pub fn new(source: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version: version.into(),
        }
    }

    /// Codec stamping the current protocol version.
    pub fn for_service(source: impl Into<String>) -> Self {
        Self::new(source, PROTOCOL_VERSION)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build a fresh envelope with a new event id and the current UTC time.
    pub fn build(&self, payload: EventPayload, correlation_id: Option<&str>) -> Envelope {
        self.build_at(payload, correlation_id, Utc::now())
    }

    pub(crate) fn build_at(
        &self,
        payload: EventPayload,
        correlation_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Envelope {
        let header = EventHeader {
            event_id: Uuid::new_v4().to_string(),
            event_type: payload.kind(),
            timestamp,
            source: self.source.clone(),
            version: self.version.clone(),
            correlation_id: correlation_id
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        };
        Envelope::from_parts(header, payload)
    }

    /// Build and serialize an envelope in one step.
    pub fn encode(
        &self,
        payload: EventPayload,
        correlation_id: Option<&str>,
    ) -> Result<Vec<u8>, EncodeError> {
        Self::serialize(&self.build(payload, correlation_id))
    }

    /// Serialize an already built envelope.
    pub fn serialize(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(envelope).map_err(|source| EncodeError::Serialize {
            kind: envelope.kind(),
            source,
        })
    }

    /// Parse an envelope, requiring its kind tag to equal `expected`.
    pub fn decode(&self, bytes: &[u8], expected: EventKind) -> Result<Envelope, DecodeError> {
        let envelope = Self::decode_any(bytes)?;
        if envelope.kind() != expected {
            return Err(DecodeError::KindMismatch {
                expected,
                actual: envelope.kind(),
            });
        }
        Ok(envelope)
    }

    /// Parse an envelope of whatever known kind it is tagged with.
    pub fn decode_any(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;

        let kind = EventKind::from_tag(&raw.event_type)
            .ok_or_else(|| DecodeError::UnknownKind(raw.event_type.clone()))?;

        let payload = EventPayload::from_value(kind, raw.payload)
            .map_err(|source| DecodeError::Payload { kind, source })?;

        let header = EventHeader {
            event_id: raw.event_id,
            event_type: kind,
            timestamp: raw.timestamp,
            source: raw.source,
            version: raw.version,
            correlation_id: raw.correlation_id.filter(|id| !id.is_empty()),
        };

        Ok(Envelope::from_parts(header, payload))
    }
}

#[cfg(test)]
mod tests;

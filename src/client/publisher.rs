//! Typed event publishing.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::broker::{Broker, BrokerError, PublishAck};
use crate::events::{EncodeError, EventCodec, EventPayload, Topic};

/// Errors publishing an event. Each names the target subject.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Cannot publish to {subject}: client is closed")]
    Closed { subject: &'static str },

    #[error("Cannot publish to {subject}: {source}")]
    Encode {
        subject: &'static str,
        #[source]
        source: EncodeError,
    },

    #[error("Cannot publish to {subject}: not connected")]
    NotConnected { subject: &'static str },

    #[error("Publish to {subject} failed: {source}")]
    Broker {
        subject: &'static str,
        #[source]
        source: BrokerError,
    },
}

impl PublishError {
    pub fn subject(&self) -> &'static str {
        match self {
            PublishError::Closed { subject }
            | PublishError::Encode { subject, .. }
            | PublishError::NotConnected { subject }
            | PublishError::Broker { subject, .. } => subject,
        }
    }
}

/// Encodes payloads and publishes them to their kind's topic with broker ack.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    codec: EventCodec,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, codec: EventCodec) -> Self {
        Self { broker, codec }
    }

    /// Publish one event and wait for the broker acknowledgement.
    pub async fn publish(
        &self,
        payload: EventPayload,
        correlation_id: Option<&str>,
    ) -> Result<PublishAck, PublishError> {
        let subject = Topic::for_kind(payload.kind()).subject();

        let bytes = self
            .codec
            .encode(payload, correlation_id)
            .map_err(|source| PublishError::Encode { subject, source })?;

        let ack = self
            .broker
            .publish(subject, Bytes::from(bytes))
            .await
            .map_err(|source| match source {
                BrokerError::NotConnected => PublishError::NotConnected { subject },
                BrokerError::Closed => PublishError::Closed { subject },
                source => PublishError::Broker { subject, source },
            })?;

        trace!(
            subject = subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            "Published event"
        );
        Ok(ack)
    }
}

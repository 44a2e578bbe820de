//! Client facade: one broker session, one stream, many subscriptions.
//!
//! `Client` implements both capability traits:
//! - `Publisher`: typed, broker-acknowledged publishing
//! - `Consumer`: typed subscriptions over durable pull consumers

mod publisher;

pub use publisher::{EventPublisher, PublishError};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{Broker, SessionState};
use crate::config::{Config, ConfigError};
use crate::consumer::{
    DispatchCounters, DispatchSettings, EventHandler, SubscriptionEngine, SubscriptionError,
    DRAIN_TIMEOUT, FETCH_MAX_WAIT,
};
use crate::events::{
    AlertPayload, ErrorPayload, EventCodec, EventPayload, Fork, HealthCheckPayload, Match, Odds,
    Topic,
};
use crate::provision::{ProvisionError, StreamProvisioner};

/// Errors constructing a client. No subscription exists after a failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[cfg(feature = "nats")]
    #[error(transparent)]
    Connection(#[from] crate::broker::ConnectionError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reasons the client reports itself unhealthy.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Client is closed")]
    Closed,

    #[error("Not connected to broker (session {0})")]
    NotConnected(SessionState),

    #[error("Stream {stream} not available: {reason}")]
    StreamUnavailable { stream: String, reason: String },
}

/// Snapshot of client state for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub is_connected: bool,
    pub is_closed: bool,
    pub url: String,
    pub subscriptions: usize,
    pub handlers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_messages: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_bytes: Option<u64>,
    pub dispatch: DispatchCounters,
}

/// Publishing capability.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_match_found(&self, event: Match) -> Result<(), PublishError>;

    async fn publish_odds_updated(&self, event: Odds) -> Result<(), PublishError>;

    async fn publish_fork_found(&self, event: Fork) -> Result<(), PublishError>;

    /// Publish an error report; `recoverable` is derived as `!critical`.
    async fn publish_error(
        &self,
        service: &str,
        operation: &str,
        message: &str,
        critical: bool,
    ) -> Result<(), PublishError>;

    async fn publish_health_check(
        &self,
        service: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), PublishError>;

    async fn publish_alert(&self, alert: AlertPayload) -> Result<(), PublishError>;

    /// Publish any payload, stamping `correlation_id` into the header.
    async fn publish_with_correlation(
        &self,
        payload: EventPayload,
        correlation_id: &str,
    ) -> Result<(), PublishError>;
}

/// Subscription capability.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn subscribe_to_matches(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError>;

    async fn subscribe_to_odds(&self, handler: Arc<dyn EventHandler>)
        -> Result<(), SubscriptionError>;

    async fn subscribe_to_forks(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError>;

    async fn subscribe_to_errors(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError>;

    /// Stop every subscription; durable consumers stay on the broker.
    async fn unsubscribe(&self) -> Result<(), SubscriptionError>;
}

/// Broker client for surebet events.
pub struct Client {
    config: Config,
    broker: Arc<dyn Broker>,
    publisher: EventPublisher,
    engine: SubscriptionEngine,
}

impl Client {
    /// Connect to NATS, then provision the event stream.
    #[cfg(feature = "nats")]
    pub async fn connect(config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        let broker = crate::broker::NatsBroker::connect(&config.nats).await?;
        Self::with_broker(config, Arc::new(broker)).await
    }

    /// Build a client over an already connected broker and provision the stream.
    ///
    /// On failure the broker session is closed before returning.
    pub async fn with_broker(
        config: Config,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, ClientError> {
        if let Err(e) = config.validate() {
            broker.close().await;
            return Err(e.into());
        }

        let codec = EventCodec::for_service(config.service_name.clone());
        let provisioner = StreamProvisioner::new(
            Arc::clone(&broker),
            config.stream.to_spec(),
            config.consumer.clone(),
        );

        if let Err(e) = provisioner.ensure_stream().await {
            broker.close().await;
            return Err(e.into());
        }

        let settings = DispatchSettings {
            batch_size: config.consumer.pull_batch_size,
            poll_interval: config.consumer.poll_interval(),
            fetch_wait: FETCH_MAX_WAIT,
        };
        let engine =
            SubscriptionEngine::new(Arc::clone(&broker), provisioner, codec.clone(), settings);
        let publisher = EventPublisher::new(Arc::clone(&broker), codec);

        info!(
            service = %config.service_name,
            url = %broker.url(),
            stream = %config.stream.name,
            "Client ready"
        );

        Ok(Self {
            config,
            broker,
            publisher,
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe `handler` to any subscribable topic.
    pub async fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        self.engine.subscribe(topic, handler).await
    }

    /// Delete and recreate the durable consumer of `topic`.
    pub async fn recreate_consumer(&self, topic: Topic) -> Result<(), SubscriptionError> {
        self.engine.recreate_consumer(topic).await
    }

    pub async fn is_closed(&self) -> bool {
        self.engine.registry().is_closed().await
    }

    /// Open and the broker session is connected.
    pub async fn is_connected(&self) -> bool {
        !self.is_closed().await && self.broker.session_state() == SessionState::Connected
    }

    pub async fn health_check(&self) -> Result<(), HealthError> {
        if self.is_closed().await {
            return Err(HealthError::Closed);
        }

        let state = self.broker.session_state();
        if state != SessionState::Connected {
            return Err(HealthError::NotConnected(state));
        }

        let stream = &self.config.stream.name;
        match self.broker.stream_info(stream).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(HealthError::StreamUnavailable {
                stream: stream.clone(),
                reason: "stream not found".to_string(),
            }),
            Err(e) => Err(HealthError::StreamUnavailable {
                stream: stream.clone(),
                reason: e.to_string(),
            }),
        }
    }

    pub async fn stats(&self) -> ClientStats {
        let (subscriptions, handlers) = self.engine.registry().counts().await;
        let is_closed = self.is_closed().await;
        let stream = if is_closed {
            None
        } else {
            self.broker
                .stream_info(&self.config.stream.name)
                .await
                .ok()
                .flatten()
        };

        ClientStats {
            is_connected: !is_closed && self.broker.session_state() == SessionState::Connected,
            is_closed,
            url: self.broker.url().to_string(),
            subscriptions,
            handlers,
            stream_messages: stream.as_ref().map(|s| s.messages),
            stream_bytes: stream.as_ref().map(|s| s.bytes),
            dispatch: self.engine.counters().await,
        }
    }

    /// Shut down: stop every loop within the drain bound, then close the session.
    ///
    /// Idempotent. Returns the last unsubscribe failure, if any; shutdown
    /// completes regardless.
    pub async fn close(&self) -> Result<(), SubscriptionError> {
        let result = match self.engine.shutdown(DRAIN_TIMEOUT).await {
            Ok(false) => return Ok(()),
            Ok(true) => Ok(()),
            Err(e) => Err(e),
        };

        self.broker.close().await;
        info!(service = %self.config.service_name, "Client closed");
        result
    }

    async fn publish(
        &self,
        payload: EventPayload,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        if self.is_closed().await {
            return Err(PublishError::Closed {
                subject: Topic::for_kind(payload.kind()).subject(),
            });
        }
        self.publisher.publish(payload, correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for Client {
    async fn publish_match_found(&self, event: Match) -> Result<(), PublishError> {
        self.publish(EventPayload::MatchFound(event), None).await
    }

    async fn publish_odds_updated(&self, event: Odds) -> Result<(), PublishError> {
        self.publish(EventPayload::OddsUpdated(event), None).await
    }

    async fn publish_fork_found(&self, event: Fork) -> Result<(), PublishError> {
        self.publish(EventPayload::ForkFound(event), None).await
    }

    async fn publish_error(
        &self,
        service: &str,
        operation: &str,
        message: &str,
        critical: bool,
    ) -> Result<(), PublishError> {
        let payload = ErrorPayload::new(service, operation, message, critical);
        if let Err(e) = self.publish(EventPayload::Error(payload), None).await {
            warn!(
                service = %service,
                operation = %operation,
                error = %e,
                "Failed to publish error event"
            );
            return Err(e);
        }
        Ok(())
    }

    async fn publish_health_check(
        &self,
        service: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), PublishError> {
        let payload = HealthCheckPayload {
            service: service.to_string(),
            status: status.to_string(),
            message: message.filter(|m| !m.is_empty()).map(str::to_string),
            metrics: None,
        };
        self.publish(EventPayload::HealthCheck(payload), None).await
    }

    async fn publish_alert(&self, alert: AlertPayload) -> Result<(), PublishError> {
        self.publish(EventPayload::AlertCreated(alert), None).await
    }

    async fn publish_with_correlation(
        &self,
        payload: EventPayload,
        correlation_id: &str,
    ) -> Result<(), PublishError> {
        self.publish(payload, Some(correlation_id)).await
    }
}

#[async_trait]
impl Consumer for Client {
    async fn subscribe_to_matches(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        self.subscribe(Topic::MatchFound, handler).await
    }

    async fn subscribe_to_odds(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        self.subscribe(Topic::OddsUpdated, handler).await
    }

    async fn subscribe_to_forks(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        self.subscribe(Topic::ForkFound, handler).await
    }

    async fn subscribe_to_errors(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        self.subscribe(Topic::Errors, handler).await
    }

    async fn unsubscribe(&self) -> Result<(), SubscriptionError> {
        self.engine.unsubscribe_all().await
    }
}

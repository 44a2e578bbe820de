//! Subscription engine: durable pull consumers dispatching to typed handlers.
//!
//! Each subscribed topic gets one durable consumer and one dispatch loop.
//! Delivery is at-least-once: a message is acked after its handler succeeds
//! and nakked (redelivered up to max-deliver) when decoding or the handler
//! fails. Handlers must be idempotent.

pub mod dispatch;
pub mod registry;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

pub use dispatch::{DispatchCounters, DispatchSettings, DispatchStats, FETCH_MAX_WAIT};
pub use registry::{ActiveSubscription, Registration, Registry, Route};
pub use supervisor::{ShutdownError, Supervisor, DRAIN_TIMEOUT};

use crate::broker::{Broker, BrokerError, PullSubscription};
use crate::events::{ErrorPayload, EventCodec, EventHeader, Fork, Match, Odds, Topic};
use crate::provision::{ProvisionError, StreamProvisioner};
use dispatch::DispatchLoop;

/// Failure reported by a handler. The message is nakked and redelivered.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler failed: {0}")]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors from subscribe, unsubscribe and consumer maintenance.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Client is closed")]
    Closed,

    #[error("Topic {0} cannot be subscribed to")]
    Unsupported(Topic),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Failed to bind consumer {consumer} for {topic}: {source}")]
    Bind {
        topic: Topic,
        consumer: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to unsubscribe consumer {consumer}: {source}")]
    Unsubscribe {
        consumer: String,
        #[source]
        source: BrokerError,
    },
}

/// Typed event callbacks, one per subscribable kind.
///
/// Returning an error naks the message; it is redelivered until the
/// consumer's max-deliver is reached.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_match_found(
        &self,
        header: &EventHeader,
        event: &Match,
    ) -> Result<(), HandlerError>;

    async fn handle_odds_updated(
        &self,
        header: &EventHeader,
        event: &Odds,
    ) -> Result<(), HandlerError>;

    async fn handle_fork_found(&self, header: &EventHeader, event: &Fork)
        -> Result<(), HandlerError>;

    async fn handle_error(
        &self,
        header: &EventHeader,
        event: &ErrorPayload,
    ) -> Result<(), HandlerError>;
}

/// Stop a pull subscription that never got a dispatch loop.
async fn release_pull(subscription: &dyn PullSubscription, consumer: &str) {
    if let Err(e) = subscription.unsubscribe().await {
        warn!(consumer = %consumer, error = %e, "Failed to release unused subscription");
    }
}

/// Ties provisioning, registry, dispatch loops and shutdown together.
pub struct SubscriptionEngine {
    broker: Arc<dyn Broker>,
    provisioner: StreamProvisioner,
    registry: Arc<Registry>,
    supervisor: Supervisor,
    codec: EventCodec,
    settings: DispatchSettings,
}

impl SubscriptionEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        provisioner: StreamProvisioner,
        codec: EventCodec,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            broker,
            provisioner,
            registry: Arc::new(Registry::new()),
            supervisor: Supervisor::new(),
            codec,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// Re-subscribing an active topic only replaces its handler.
    pub async fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        if self.registry.is_closed().await {
            return Err(SubscriptionError::Closed);
        }
        if !topic.is_subscribable() {
            return Err(SubscriptionError::Unsupported(topic));
        }

        let (consumer, _) = self.provisioner.ensure_consumer(topic).await?;

        if self
            .registry
            .replace_handler(topic, Arc::clone(&handler))
            .await?
        {
            info!(topic = %topic, consumer = %consumer, "Replaced handler");
            return Ok(());
        }

        let subscription = self
            .broker
            .bind_pull(self.provisioner.stream_name(), &consumer)
            .await
            .map_err(|source| SubscriptionError::Bind {
                topic,
                consumer: consumer.clone(),
                source,
            })?;

        let active = ActiveSubscription {
            topic,
            consumer: consumer.clone(),
            subscription: Arc::clone(&subscription),
        };

        let registration = match self.registry.register(topic, handler, active).await {
            Ok(registration) => registration,
            Err(e) => {
                release_pull(subscription.as_ref(), &consumer).await;
                return Err(e);
            }
        };

        if registration == Registration::Replaced {
            // Lost a race with a concurrent subscribe on the same topic.
            release_pull(subscription.as_ref(), &consumer).await;
            info!(topic = %topic, consumer = %consumer, "Replaced handler");
            return Ok(());
        }

        let dispatch = DispatchLoop {
            topic,
            subscription,
            registry: Arc::clone(&self.registry),
            provisioner: self.provisioner.clone(),
            codec: self.codec.clone(),
            stats: self.registry.stats_for(topic).await,
            settings: self.settings,
        };
        if !self.supervisor.spawn(|cancel| dispatch.run(cancel)).await {
            return Err(SubscriptionError::Closed);
        }

        info!(topic = %topic, consumer = %consumer, "Subscribed");
        Ok(())
    }

    /// Unsubscribe every active subscription.
    ///
    /// Registry and subscription list are always cleared; the last
    /// unsubscribe failure, if any, is returned.
    pub async fn unsubscribe_all(&self) -> Result<(), SubscriptionError> {
        let mut last_error = None;

        for active in self.registry.drain().await {
            match active.subscription.unsubscribe().await {
                Ok(()) => info!(topic = %active.topic, consumer = %active.consumer, "Unsubscribed"),
                Err(source) => {
                    warn!(consumer = %active.consumer, error = %source, "Unsubscribe failed");
                    last_error = Some(SubscriptionError::Unsubscribe {
                        consumer: active.consumer,
                        source,
                    });
                }
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Delete and recreate the durable consumer of `topic`.
    ///
    /// A running dispatch loop keeps its subscription and resumes on the new consumer.
    pub async fn recreate_consumer(&self, topic: Topic) -> Result<(), SubscriptionError> {
        if self.registry.is_closed().await {
            return Err(SubscriptionError::Closed);
        }
        self.provisioner.recreate_consumer(topic).await?;
        Ok(())
    }

    /// Stop every loop: mark closed, cancel, unsubscribe, then wait up to
    /// `drain_timeout`.
    ///
    /// Returns `Ok(false)` when the engine was already shut down.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<bool, SubscriptionError> {
        if !self.registry.mark_closed().await {
            return Ok(false);
        }

        self.supervisor.cancel();
        let unsubscribed = self.unsubscribe_all().await;

        if let Err(e) = self.supervisor.drain(drain_timeout).await {
            warn!(error = %e, "Shutdown proceeding with unfinished loops");
        }

        unsubscribed.map(|()| true)
    }

    pub async fn counters(&self) -> DispatchCounters {
        self.registry.counters().await
    }

    pub async fn running_loops(&self) -> usize {
        self.supervisor.running().await
    }
}

//! Per-subscription fetch, dispatch and settle loop.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

use super::registry::{Registry, Route};
use crate::broker::{Delivery, FetchError, PullSubscription};
use crate::events::{EventCodec, EventPayload, Topic};
use crate::provision::StreamProvisioner;

/// Longest a single fetch waits for messages.
pub const FETCH_MAX_WAIT: Duration = Duration::from_secs(5);

/// Live counters of one subscription.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    nakked: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounters {
        DispatchCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nakked: self.nakked.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub delivered: u64,
    pub acked: u64,
    pub nakked: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
}

impl Add for DispatchCounters {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            delivered: self.delivered + other.delivered,
            acked: self.acked + other.acked,
            nakked: self.nakked + other.nakked,
            decode_failures: self.decode_failures + other.decode_failures,
            handler_failures: self.handler_failures + other.handler_failures,
        }
    }
}

/// Fetch pacing shared by every loop of a client.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub fetch_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nak,
}

/// The loop owned by one subscription.
pub(crate) struct DispatchLoop {
    pub(crate) topic: Topic,
    pub(crate) subscription: Arc<dyn PullSubscription>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) provisioner: StreamProvisioner,
    pub(crate) codec: EventCodec,
    pub(crate) stats: Arc<DispatchStats>,
    pub(crate) settings: DispatchSettings,
}

impl DispatchLoop {
    /// Run until `cancel` flips to `true` or the subscription is closed.
    pub(crate) async fn run(self, mut cancel: watch::Receiver<bool>) {
        let consumer = self.subscription.consumer().to_string();
        debug!(topic = %self.topic, consumer = %consumer, "Dispatch loop started");

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *cancel.borrow() {
                break;
            }

            tokio::select! {
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                _ = cancel.changed() => break,
                fetched = self
                    .subscription
                    .fetch(self.settings.batch_size, self.settings.fetch_wait) => fetched,
            };

            match fetched {
                Ok(deliveries) => self.process_batch(deliveries, &cancel).await,
                Err(FetchError::Timeout) => {}
                Err(FetchError::ConsumerNotFound(name)) => {
                    warn!(
                        topic = %self.topic,
                        consumer = %name,
                        "Durable consumer missing, recreating"
                    );
                    if let Err(e) = self.provisioner.recreate_consumer(self.topic).await {
                        error!(topic = %self.topic, error = %e, "Consumer recreation failed");
                    }
                }
                Err(FetchError::Closed) => {
                    debug!(topic = %self.topic, consumer = %consumer, "Subscription closed");
                    break;
                }
                Err(FetchError::NotConnected) => {
                    debug!(topic = %self.topic, "Fetch skipped while reconnecting");
                }
                Err(e) => {
                    warn!(topic = %self.topic, consumer = %consumer, error = %e, "Fetch failed");
                }
            }
        }

        debug!(topic = %self.topic, consumer = %consumer, "Dispatch loop stopped");
    }

    /// Dispatch a batch in fetch order; settlements run concurrently and are
    /// all joined before returning.
    ///
    /// Once the loop is cancelled or its subscription detached, the rest of
    /// the batch is nakked without reaching a handler.
    async fn process_batch(
        &self,
        deliveries: Vec<Box<dyn Delivery>>,
        cancel: &watch::Receiver<bool>,
    ) {
        let mut settlements = JoinSet::new();
        let mut detached = 0usize;

        for delivery in deliveries {
            DispatchStats::incr(&self.stats.delivered);
            let cancelled = *cancel.borrow();
            let settlement = if detached > 0 || cancelled {
                detached += 1;
                Settlement::Nak
            } else {
                match self.registry.route(self.topic, &self.subscription).await {
                    Route::Detached => {
                        detached += 1;
                        Settlement::Nak
                    }
                    route => self.dispatch(route, delivery.as_ref()).await,
                }
            };
            let stats = Arc::clone(&self.stats);
            let topic = self.topic;

            settlements.spawn(async move {
                let result = match settlement {
                    Settlement::Ack => delivery.ack().await,
                    Settlement::Nak => delivery.nak().await,
                };
                match (settlement, result) {
                    (Settlement::Ack, Ok(())) => DispatchStats::incr(&stats.acked),
                    (Settlement::Nak, Ok(())) => DispatchStats::incr(&stats.nakked),
                    (Settlement::Ack, Err(e)) => {
                        warn!(topic = %topic, subject = %delivery.subject(), error = %e, "Ack failed")
                    }
                    (Settlement::Nak, Err(e)) => {
                        warn!(topic = %topic, subject = %delivery.subject(), error = %e, "Nak failed")
                    }
                }
            });
        }

        if detached > 0 {
            debug!(
                topic = %self.topic,
                messages = detached,
                "Subscription stopping, returning unprocessed messages for redelivery"
            );
        }

        while let Some(joined) = settlements.join_next().await {
            if let Err(e) = joined {
                error!(topic = %self.topic, error = %e, "Settlement task failed");
            }
        }
    }

    /// Decode and hand one message to the registered handler.
    async fn dispatch(&self, route: Route, delivery: &dyn Delivery) -> Settlement {
        let handler = match route {
            Route::Handler(handler) => handler,
            Route::Unhandled => {
                error!(
                    topic = %self.topic,
                    subject = %delivery.subject(),
                    "No handler registered, acknowledging message"
                );
                return Settlement::Ack;
            }
            Route::Detached => return Settlement::Nak,
        };

        let envelope = match self
            .codec
            .decode(delivery.payload(), self.topic.event_kind())
        {
            Ok(envelope) => envelope,
            Err(e) => {
                DispatchStats::incr(&self.stats.decode_failures);
                warn!(
                    topic = %self.topic,
                    subject = %delivery.subject(),
                    delivery = delivery.delivery_count(),
                    error = %e,
                    "Failed to decode event"
                );
                return Settlement::Nak;
            }
        };

        let (header, payload) = envelope.into_parts();
        let result = match &payload {
            EventPayload::MatchFound(event) => handler.handle_match_found(&header, event).await,
            EventPayload::OddsUpdated(event) => handler.handle_odds_updated(&header, event).await,
            EventPayload::ForkFound(event) => handler.handle_fork_found(&header, event).await,
            EventPayload::Error(event) => handler.handle_error(&header, event).await,
            EventPayload::AlertCreated(_) | EventPayload::HealthCheck(_) => {
                error!(
                    topic = %self.topic,
                    kind = %header.event_type,
                    "No handler method for event kind, acknowledging message"
                );
                return Settlement::Ack;
            }
        };

        match result {
            Ok(()) => {
                trace!(topic = %self.topic, event_id = %header.event_id, "Event handled");
                Settlement::Ack
            }
            Err(e) => {
                DispatchStats::incr(&self.stats.handler_failures);
                warn!(
                    topic = %self.topic,
                    event_id = %header.event_id,
                    delivery = delivery.delivery_count(),
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                Settlement::Nak
            }
        }
    }
}

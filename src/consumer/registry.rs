//! Handler and subscription registry.
//!
//! One lock guards handlers, active subscriptions and the closed flag so that
//! registration and shutdown observe a consistent view. It is never held
//! across a fetch, a handler call or a publish.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::dispatch::{DispatchCounters, DispatchStats};
use super::{EventHandler, SubscriptionError};
use crate::broker::PullSubscription;
use crate::events::Topic;

/// A bound pull subscription with a running dispatch loop.
#[derive(Clone)]
pub struct ActiveSubscription {
    pub topic: Topic,
    pub consumer: String,
    pub subscription: Arc<dyn PullSubscription>,
}

/// Where a fetched message should go.
pub enum Route {
    Handler(Arc<dyn EventHandler>),
    /// Subscription is current but no handler is registered for its topic.
    Unhandled,
    /// Subscription was drained, replaced or closed; leave the message for redelivery.
    Detached,
}

/// What a registration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New subscription recorded; its loop must be launched.
    Started,
    /// Topic already had a subscription; only the handler changed.
    Replaced,
}

#[derive(Default)]
struct RegistryState {
    closed: bool,
    handlers: HashMap<Topic, Arc<dyn EventHandler>>,
    subscriptions: HashMap<Topic, ActiveSubscription>,
    /// Survives `drain` so counters stay meaningful after shutdown.
    stats: HashMap<Topic, Arc<DispatchStats>>,
}

/// Topic → handler map plus the list of active subscriptions.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Mark the registry closed. Returns `true` only for the call that closed it.
    pub async fn mark_closed(&self) -> bool {
        let mut state = self.state.write().await;
        !std::mem::replace(&mut state.closed, true)
    }

    /// Swap the handler of a topic that already has a running subscription.
    ///
    /// Returns `Ok(false)` without touching anything when the topic is inactive.
    pub async fn replace_handler(
        &self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<bool, SubscriptionError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(SubscriptionError::Closed);
        }
        if !state.subscriptions.contains_key(&topic) {
            return Ok(false);
        }
        state.handlers.insert(topic, handler);
        Ok(true)
    }

    /// Record a handler and its subscription. Last registration wins.
    pub async fn register(
        &self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
        subscription: ActiveSubscription,
    ) -> Result<Registration, SubscriptionError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(SubscriptionError::Closed);
        }
        state.handlers.insert(topic, handler);
        if state.subscriptions.contains_key(&topic) {
            return Ok(Registration::Replaced);
        }
        state.subscriptions.insert(topic, subscription);
        Ok(Registration::Started)
    }

    /// Route a message fetched through `subscription` for `topic`.
    pub async fn route(&self, topic: Topic, subscription: &Arc<dyn PullSubscription>) -> Route {
        let state = self.state.read().await;
        let current = !state.closed
            && state
                .subscriptions
                .get(&topic)
                .is_some_and(|active| Arc::ptr_eq(&active.subscription, subscription));
        if !current {
            return Route::Detached;
        }
        match state.handlers.get(&topic) {
            Some(handler) => Route::Handler(Arc::clone(handler)),
            None => Route::Unhandled,
        }
    }

    #[cfg(test)]
    pub(crate) async fn remove_handler(&self, topic: Topic) {
        self.state.write().await.handlers.remove(&topic);
    }

    /// Remove every handler and subscription, returning the subscriptions.
    pub async fn drain(&self) -> Vec<ActiveSubscription> {
        let mut state = self.state.write().await;
        state.handlers.clear();
        state.subscriptions.drain().map(|(_, sub)| sub).collect()
    }

    /// Counters for a topic, created on first use.
    pub async fn stats_for(&self, topic: Topic) -> Arc<DispatchStats> {
        let mut state = self.state.write().await;
        Arc::clone(state.stats.entry(topic).or_default())
    }

    /// (active subscriptions, registered handlers)
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.subscriptions.len(), state.handlers.len())
    }

    /// Dispatch counters summed over every topic ever subscribed.
    pub async fn counters(&self) -> DispatchCounters {
        let state = self.state.read().await;
        state
            .stats
            .values()
            .fold(DispatchCounters::default(), |acc, stats| acc + stats.snapshot())
    }
}

//! Broker seam: the JetStream operations this client relies on.
//!
//! This module contains:
//! - `Broker` trait: session state, stream/consumer management, acknowledged publish
//! - `PullSubscription` trait: bounded-size, bounded-wait fetch against a durable consumer
//! - `Delivery` trait: one fetched message with ack/nak
//! - Implementations: NATS JetStream (`nats` feature), in-memory mock

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

pub use mock::MockBroker;
#[cfg(feature = "nats")]
pub use nats::{ConnectionError, NatsBroker};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Session is disconnected or reconnecting; the call may succeed later.
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Broker session is closed")]
    Closed,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Broker request failed: {0}")]
    Request(String),

    #[error("Publish to '{subject}' not acknowledged: {message}")]
    PublishAck { subject: String, message: String },
}

/// Errors returned by a pull fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The wait expired with no messages available.
    #[error("Fetch wait expired without messages")]
    Timeout,

    #[error("Consumer '{0}' not found")]
    ConsumerNotFound(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Subscription is closed")]
    Closed,

    #[error("Fetch failed: {0}")]
    Other(String),
}

/// Connection state of a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet connected.
    Pending,
    Connected,
    /// Connection lost; the transport is retrying.
    Reconnecting,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lock-free holder for a session state, written from transport callbacks.
#[derive(Debug)]
pub(crate) struct SessionCell(AtomicU8);

impl SessionCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(Self::encode(state)))
    }

    pub(crate) fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Pending,
            1 => SessionState::Connected,
            2 => SessionState::Reconnecting,
            _ => SessionState::Closed,
        }
    }

    /// Store a new state unless the session is already closed.
    pub(crate) fn set(&self, state: SessionState) {
        let next = Self::encode(state);
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != Self::encode(SessionState::Closed)).then_some(next)
            });
    }

    fn encode(state: SessionState) -> u8 {
        match state {
            SessionState::Pending => 0,
            SessionState::Connected => 1,
            SessionState::Reconnecting => 2,
            SessionState::Closed => 3,
        }
    }
}

/// Durable stream definition. Storage is always file-backed with limits retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    /// Subject patterns; `*` and `>` wildcards allowed.
    pub subjects: Vec<String>,
    pub max_age: Duration,
    pub max_messages: i64,
    pub replicas: usize,
}

/// Live stream configuration and state as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamSpec,
    pub messages: u64,
    pub bytes: u64,
}

/// Durable pull consumer definition.
///
/// Policies are fixed: explicit ack, deliver new messages only, instant replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
    pub description: Option<String>,
}

/// Whether a create call made something new or found it already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Broker acknowledgement of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// A broker session with JetStream capabilities.
///
/// Implementations:
/// - `NatsBroker`: NATS JetStream via async-nats
/// - `MockBroker`: in-memory JetStream semantics for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Current session state.
    fn session_state(&self) -> SessionState;

    /// URL the session was configured with.
    fn url(&self) -> &str;

    /// Stream info, `None` when the stream does not exist.
    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>>;

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()>;

    /// Create a durable consumer, or report that one with that name exists.
    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<CreateOutcome>;

    /// Delete a durable consumer. Returns `false` when it did not exist.
    async fn delete_consumer(&self, stream: &str, durable_name: &str) -> Result<bool>;

    /// Bind a pull subscription to an existing durable consumer.
    async fn bind_pull(
        &self,
        stream: &str,
        durable_name: &str,
    ) -> Result<Arc<dyn PullSubscription>>;

    /// Publish and wait for the broker's acknowledgement.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck>;

    /// Flush and close the session. Idempotent.
    async fn close(&self);
}

/// Client-side pull handle over one durable consumer.
#[async_trait]
pub trait PullSubscription: Send + Sync {
    /// Durable consumer this subscription is bound to.
    fn consumer(&self) -> &str;

    /// Fetch up to `batch` messages, waiting at most `max_wait`.
    ///
    /// Returns `FetchError::Timeout` when nothing arrived in time.
    async fn fetch(
        &self,
        batch: usize,
        max_wait: Duration,
    ) -> std::result::Result<Vec<Box<dyn Delivery>>, FetchError>;

    /// Stop fetching. The durable consumer itself is left on the broker.
    async fn unsubscribe(&self) -> Result<()>;
}

/// A fetched message awaiting settlement.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// 1 for the first delivery, incremented on each redelivery.
    fn delivery_count(&self) -> u64;

    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; the broker redelivers until max-deliver.
    async fn nak(&self) -> Result<()>;
}

/// Match a subject against a filter with NATS wildcard semantics.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

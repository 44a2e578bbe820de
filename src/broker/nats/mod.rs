//! NATS JetStream broker implementation.
//!
//! Streams are file-backed with limits retention. Consumers are durable pull
//! consumers with explicit ack, deliver-new and instant replay.

mod connection;

pub use connection::ConnectionError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy, PullConsumer, ReplayPolicy},
    context::GetStreamErrorKind,
    stream::{
        Config as JsStreamConfig, ConsumerError, ConsumerErrorKind, RetentionPolicy,
        Stream as JsStream, StorageType,
    },
    AckKind, Context, ErrorCode,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, warn};

use super::{
    Broker, BrokerError, ConsumerSpec, CreateOutcome, Delivery, FetchError, PublishAck,
    PullSubscription, Result, SessionCell, SessionState, StreamInfo, StreamSpec,
};
use crate::config::NatsConfig;

fn is_consumer_not_found(err: &ConsumerError) -> bool {
    matches!(
        err.kind(),
        ConsumerErrorKind::JetStream(js) if js.error_code() == ErrorCode::CONSUMER_NOT_FOUND
    )
}

/// Look up a pull consumer. `Ok(None)` when the server reports it missing.
async fn find_consumer(
    jetstream: &Context,
    stream: &str,
    durable_name: &str,
) -> std::result::Result<Option<PullConsumer>, ConsumerError> {
    match jetstream
        .get_consumer_from_stream::<PullConfig, _, _>(durable_name, stream)
        .await
    {
        Ok(consumer) => Ok(Some(consumer)),
        Err(err) if is_consumer_not_found(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn session_error(session: &SessionCell) -> Option<BrokerError> {
    match session.get() {
        SessionState::Connected => None,
        SessionState::Closed => Some(BrokerError::Closed),
        SessionState::Pending | SessionState::Reconnecting => Some(BrokerError::NotConnected),
    }
}

/// JetStream broker over one NATS session.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: Context,
    session: Arc<SessionCell>,
    url: String,
}

impl NatsBroker {
    /// Connect using the given settings.
    ///
    /// Fails when the server is unreachable, rejects credentials, fails the
    /// TLS handshake, or does not answer within the connect timeout.
    pub async fn connect(config: &NatsConfig) -> std::result::Result<Self, ConnectionError> {
        let session = Arc::new(SessionCell::new(SessionState::Pending));
        let client = connection::connect(config, Arc::clone(&session)).await?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            session,
            url: config.url.clone(),
        })
    }

    /// Underlying NATS client.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn check_session(&self) -> Result<()> {
        session_error(&self.session).map_or(Ok(()), Err)
    }

    async fn find_stream(&self, name: &str) -> Result<Option<JsStream>> {
        match self.jetstream.get_stream(name).await {
            Ok(stream) => Ok(Some(stream)),
            Err(err) => match err.kind() {
                GetStreamErrorKind::JetStream(js)
                    if js.error_code() == ErrorCode::STREAM_NOT_FOUND =>
                {
                    Ok(None)
                }
                _ => Err(BrokerError::Request(format!(
                    "Failed to get stream {}: {}",
                    name, err
                ))),
            },
        }
    }

    async fn require_stream(&self, name: &str) -> Result<JsStream> {
        self.find_stream(name)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                kind: "stream",
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn session_state(&self) -> SessionState {
        self.session.get()
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>> {
        self.check_session()?;
        let Some(stream) = self.find_stream(name).await? else {
            return Ok(None);
        };

        let info = stream.cached_info();
        Ok(Some(StreamInfo {
            config: StreamSpec {
                name: info.config.name.clone(),
                subjects: info.config.subjects.clone(),
                max_age: info.config.max_age,
                max_messages: info.config.max_messages,
                replicas: info.config.num_replicas,
            },
            messages: info.state.messages,
            bytes: info.state.bytes,
        }))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.check_session()?;
        self.jetstream
            .create_stream(JsStreamConfig {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                max_age: spec.max_age,
                max_messages: spec.max_messages,
                num_replicas: spec.replicas,
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Request(format!("Failed to create stream: {}", e)))?;
        Ok(())
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<CreateOutcome> {
        self.check_session()?;
        let js_stream = self.require_stream(stream).await?;

        let existing = find_consumer(&self.jetstream, stream, &spec.durable_name)
            .await
            .map_err(|err| {
                BrokerError::Request(format!(
                    "Failed to look up consumer {}: {}",
                    spec.durable_name, err
                ))
            })?;
        if existing.is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }

        js_stream
            .create_consumer(PullConfig {
                durable_name: Some(spec.durable_name.clone()),
                description: spec.description.clone(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: spec.ack_wait,
                max_deliver: spec.max_deliver,
                max_ack_pending: spec.max_ack_pending,
                deliver_policy: DeliverPolicy::New,
                replay_policy: ReplayPolicy::Instant,
                filter_subject: spec.filter_subject.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BrokerError::Request(format!(
                    "Failed to create consumer {}: {}",
                    spec.durable_name, e
                ))
            })?;

        Ok(CreateOutcome::Created)
    }

    async fn delete_consumer(&self, stream: &str, durable_name: &str) -> Result<bool> {
        self.check_session()?;
        let stream = self.require_stream(stream).await?;

        match stream.delete_consumer(durable_name).await {
            Ok(_) => Ok(true),
            Err(err) if is_consumer_not_found(&err) => Ok(false),
            Err(err) => Err(BrokerError::Request(format!(
                "Failed to delete consumer {}: {}",
                durable_name, err
            ))),
        }
    }

    async fn bind_pull(
        &self,
        stream: &str,
        durable_name: &str,
    ) -> Result<Arc<dyn PullSubscription>> {
        self.check_session()?;
        self.require_stream(stream).await?;

        let consumer = find_consumer(&self.jetstream, stream, durable_name)
            .await
            .map_err(|err| {
                BrokerError::Request(format!("Failed to bind {}: {}", durable_name, err))
            })?
            .ok_or_else(|| BrokerError::NotFound {
                kind: "consumer",
                name: durable_name.to_string(),
            })?;

        Ok(Arc::new(NatsPullSubscription {
            consumer,
            jetstream: self.jetstream.clone(),
            stream: stream.to_string(),
            durable_name: durable_name.to_string(),
            session: Arc::clone(&self.session),
            closed: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck> {
        self.check_session()?;

        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::PublishAck {
                subject: subject.to_string(),
                message: e.to_string(),
            })?
            .await
            .map_err(|e| BrokerError::PublishAck {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn close(&self) {
        if self.session.get() == SessionState::Closed {
            return;
        }
        self.session.set(SessionState::Closed);
        if let Err(e) = self.client.drain().await {
            warn!(url = %self.url, error = %e, "Drain on close failed");
        }
        debug!(url = %self.url, "NATS session drained");
    }
}

/// Pull subscription bound to one durable consumer.
struct NatsPullSubscription {
    consumer: PullConsumer,
    jetstream: Context,
    stream: String,
    durable_name: String,
    session: Arc<SessionCell>,
    closed: AtomicBool,
}

impl NatsPullSubscription {
    /// Classify a failed fetch, probing whether the consumer still exists.
    async fn fetch_failure(&self, message: String) -> FetchError {
        match self.session.get() {
            SessionState::Connected => {}
            SessionState::Closed => return FetchError::Closed,
            SessionState::Pending | SessionState::Reconnecting => return FetchError::NotConnected,
        }

        match find_consumer(&self.jetstream, &self.stream, &self.durable_name).await {
            Ok(None) => FetchError::ConsumerNotFound(self.durable_name.clone()),
            _ => FetchError::Other(message),
        }
    }
}

#[async_trait]
impl PullSubscription for NatsPullSubscription {
    fn consumer(&self) -> &str {
        &self.durable_name
    }

    async fn fetch(
        &self,
        batch: usize,
        max_wait: Duration,
    ) -> std::result::Result<Vec<Box<dyn Delivery>>, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Closed);
        }
        match session_error(&self.session) {
            None => {}
            Some(BrokerError::Closed) => return Err(FetchError::Closed),
            Some(_) => return Err(FetchError::NotConnected),
        }

        let mut messages = match self
            .consumer
            .batch()
            .max_messages(batch)
            .expires(max_wait)
            .messages()
            .await
        {
            Ok(messages) => messages,
            Err(err) => return Err(self.fetch_failure(err.to_string()).await),
        };

        let mut deliveries: Vec<Box<dyn Delivery>> = Vec::with_capacity(batch);
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => deliveries.push(Box::new(NatsDelivery::new(message))),
                Err(err) if deliveries.is_empty() => {
                    return Err(self.fetch_failure(err.to_string()).await)
                }
                Err(err) => {
                    debug!(consumer = %self.durable_name, error = %err, "Batch ended early");
                    break;
                }
            }
        }

        if deliveries.is_empty() {
            return Err(FetchError::Timeout);
        }
        Ok(deliveries)
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A JetStream message awaiting ack or nak.
struct NatsDelivery {
    message: jetstream::Message,
    subject: String,
    delivered: u64,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Self {
        let delivered = message
            .info()
            .ok()
            .and_then(|info| u64::try_from(info.delivered).ok())
            .unwrap_or(1);
        let subject = message.subject.to_string();
        Self {
            message,
            subject,
            delivered,
        }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Request(format!("Ack failed: {}", e)))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Request(format!("Nak failed: {}", e)))
    }
}

//! Mock broker implementation for testing.
//!
//! Models the JetStream behaviour the subscription engine depends on:
//! deliver-new consumers, explicit ack, nak-triggered redelivery, ack-wait
//! expiry, the max-deliver cutoff and the max-ack-pending ceiling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    subject_matches, Broker, BrokerError, ConsumerSpec, CreateOutcome, Delivery, FetchError,
    PublishAck, PullSubscription, Result, SessionCell, SessionState, StreamInfo, StreamSpec,
};

const MOCK_URL: &str = "mock://localhost";

struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
}

struct Pending {
    deliveries: u64,
    redeliver_at: Instant,
}

struct MockConsumer {
    spec: ConsumerSpec,
    /// Highest stream sequence already considered for first delivery.
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
}

struct ReadyMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
    deliveries: u64,
}

impl MockConsumer {
    /// Collect up to `batch` deliverable messages: due redeliveries first, then new ones.
    fn take_ready(
        &mut self,
        messages: &[StoredMessage],
        batch: usize,
        now: Instant,
    ) -> Vec<ReadyMessage> {
        let mut ready = Vec::new();
        let max_deliver = u64::try_from(self.spec.max_deliver).unwrap_or(u64::MAX);
        let max_pending = usize::try_from(self.spec.max_ack_pending).unwrap_or(usize::MAX);

        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.redeliver_at <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            if ready.len() >= batch {
                break;
            }
            let stored = messages
                .binary_search_by_key(&seq, |m| m.seq)
                .ok()
                .map(|idx| &messages[idx]);
            let (Some(stored), Some(pending)) = (stored, self.pending.get_mut(&seq)) else {
                self.pending.remove(&seq);
                continue;
            };
            if max_deliver > 0 && pending.deliveries >= max_deliver {
                self.pending.remove(&seq);
                continue;
            }
            pending.deliveries += 1;
            pending.redeliver_at = now + self.spec.ack_wait;
            ready.push(ReadyMessage {
                seq,
                subject: stored.subject.clone(),
                payload: stored.payload.clone(),
                deliveries: pending.deliveries,
            });
        }

        let cursor = self.cursor;
        for stored in messages.iter().filter(|m| m.seq > cursor) {
            if ready.len() >= batch || self.pending.len() >= max_pending {
                break;
            }
            self.cursor = stored.seq;
            if !subject_matches(&self.spec.filter_subject, &stored.subject) {
                continue;
            }
            self.pending.insert(
                stored.seq,
                Pending {
                    deliveries: 1,
                    redeliver_at: now + self.spec.ack_wait,
                },
            );
            ready.push(ReadyMessage {
                seq: stored.seq,
                subject: stored.subject.clone(),
                payload: stored.payload.clone(),
                deliveries: 1,
            });
        }

        ready
    }

    fn next_redelivery(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.redeliver_at).min()
    }
}

struct MockStream {
    spec: StreamSpec,
    messages: Vec<StoredMessage>,
    last_seq: u64,
    consumers: HashMap<String, MockConsumer>,
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, MockStream>,
    fail_on_publish: bool,
    fail_on_unsubscribe: bool,
    fail_on_delete_consumer: bool,
    stall_fetches: bool,
}

struct Shared {
    state: Mutex<MockState>,
    session: SessionCell,
    notify: Notify,
    fetch_calls: AtomicUsize,
}

/// In-memory broker for testing.
#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create a connected mock broker with no streams.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState::default()),
                session: SessionCell::new(SessionState::Connected),
                notify: Notify::new(),
                fetch_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate transport state changes (e.g. `Reconnecting`).
    pub fn set_session_state(&self, state: SessionState) {
        self.shared.session.set(state);
        self.shared.notify.notify_waiters();
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.shared.state.lock().await.fail_on_publish = fail;
    }

    pub async fn set_fail_on_unsubscribe(&self, fail: bool) {
        self.shared.state.lock().await.fail_on_unsubscribe = fail;
    }

    pub async fn set_fail_on_delete_consumer(&self, fail: bool) {
        self.shared.state.lock().await.fail_on_delete_consumer = fail;
    }

    /// When set, fetches block forever instead of honouring their wait.
    pub async fn set_stall_fetches(&self, stall: bool) {
        self.shared.state.lock().await.stall_fetches = stall;
    }

    /// Number of fetch calls issued so far.
    pub fn fetch_calls(&self) -> usize {
        self.shared.fetch_calls.load(Ordering::SeqCst)
    }

    /// Messages currently stored in a stream.
    pub async fn message_count(&self, stream: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Delivered-but-unacknowledged messages of a consumer.
    pub async fn pending_count(&self, stream: &str, durable_name: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable_name))
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    pub async fn consumer_names(&self, stream: &str) -> Vec<String> {
        let state = self.shared.state.lock().await;
        let mut names: Vec<String> = state
            .streams
            .get(stream)
            .map(|s| s.consumers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub async fn consumer_spec(&self, stream: &str, durable_name: &str) -> Option<ConsumerSpec> {
        self.shared
            .state
            .lock()
            .await
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable_name))
            .map(|c| c.spec.clone())
    }

    fn check_session(&self) -> Result<()> {
        match self.shared.session.get() {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(BrokerError::Closed),
            SessionState::Pending | SessionState::Reconnecting => Err(BrokerError::NotConnected),
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn session_state(&self) -> SessionState {
        self.shared.session.get()
    }

    fn url(&self) -> &str {
        MOCK_URL
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>> {
        self.check_session()?;
        let state = self.shared.state.lock().await;
        Ok(state.streams.get(name).map(|s| StreamInfo {
            config: s.spec.clone(),
            messages: s.messages.len() as u64,
            bytes: s.messages.iter().map(|m| m.payload.len() as u64).sum(),
        }))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.check_session()?;
        let mut state = self.shared.state.lock().await;
        if state.streams.contains_key(&spec.name) {
            return Err(BrokerError::Request(format!(
                "stream name already in use: {}",
                spec.name
            )));
        }
        state.streams.insert(
            spec.name.clone(),
            MockStream {
                spec: spec.clone(),
                messages: Vec::new(),
                last_seq: 0,
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<CreateOutcome> {
        self.check_session()?;
        let mut state = self.shared.state.lock().await;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "stream",
                name: stream.to_string(),
            })?;

        if stream_state.consumers.contains_key(&spec.durable_name) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let cursor = stream_state.last_seq;
        stream_state.consumers.insert(
            spec.durable_name.clone(),
            MockConsumer {
                spec: spec.clone(),
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn delete_consumer(&self, stream: &str, durable_name: &str) -> Result<bool> {
        self.check_session()?;
        let removed = {
            let mut state = self.shared.state.lock().await;
            if state.fail_on_delete_consumer {
                return Err(BrokerError::Request(format!(
                    "mock delete failure for {}",
                    durable_name
                )));
            }
            state
                .streams
                .get_mut(stream)
                .map(|s| s.consumers.remove(durable_name).is_some())
                .unwrap_or(false)
        };
        self.shared.notify.notify_waiters();
        Ok(removed)
    }

    async fn bind_pull(
        &self,
        stream: &str,
        durable_name: &str,
    ) -> Result<Arc<dyn PullSubscription>> {
        self.check_session()?;
        let state = self.shared.state.lock().await;
        let exists = state
            .streams
            .get(stream)
            .is_some_and(|s| s.consumers.contains_key(durable_name));
        if !exists {
            return Err(BrokerError::NotFound {
                kind: "consumer",
                name: durable_name.to_string(),
            });
        }

        Ok(Arc::new(MockPullSubscription {
            shared: Arc::clone(&self.shared),
            stream: stream.to_string(),
            consumer: durable_name.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck> {
        self.check_session()?;
        let ack = {
            let mut state = self.shared.state.lock().await;
            if state.fail_on_publish {
                return Err(BrokerError::PublishAck {
                    subject: subject.to_string(),
                    message: "mock publish failure".to_string(),
                });
            }

            let stream = state
                .streams
                .values_mut()
                .find(|s| s.spec.subjects.iter().any(|f| subject_matches(f, subject)))
                .ok_or_else(|| BrokerError::PublishAck {
                    subject: subject.to_string(),
                    message: "no stream matches subject".to_string(),
                })?;

            stream.last_seq += 1;
            stream.messages.push(StoredMessage {
                seq: stream.last_seq,
                subject: subject.to_string(),
                payload,
            });

            PublishAck {
                stream: stream.spec.name.clone(),
                sequence: stream.last_seq,
                duplicate: false,
            }
        };
        self.shared.notify.notify_waiters();
        Ok(ack)
    }

    async fn close(&self) {
        self.shared.session.set(SessionState::Closed);
        self.shared.notify.notify_waiters();
    }
}

struct MockPullSubscription {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    closed: AtomicBool,
}

#[async_trait]
impl PullSubscription for MockPullSubscription {
    fn consumer(&self) -> &str {
        &self.consumer
    }

    async fn fetch(
        &self,
        batch: usize,
        max_wait: Duration,
    ) -> std::result::Result<Vec<Box<dyn Delivery>>, FetchError> {
        self.shared.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(FetchError::Closed);
            }
            match self.shared.session.get() {
                SessionState::Connected => {}
                SessionState::Closed => return Err(FetchError::Closed),
                SessionState::Pending | SessionState::Reconnecting => {
                    return Err(FetchError::NotConnected)
                }
            }

            let next_redelivery = {
                let mut state = self.shared.state.lock().await;
                if state.stall_fetches {
                    drop(state);
                    return std::future::pending().await;
                }

                let consumer_missing = || FetchError::ConsumerNotFound(self.consumer.clone());
                let stream = state
                    .streams
                    .get_mut(&self.stream)
                    .ok_or_else(consumer_missing)?;
                let MockStream {
                    messages,
                    consumers,
                    ..
                } = stream;
                let consumer = consumers.get_mut(&self.consumer).ok_or_else(consumer_missing)?;

                let ready = consumer.take_ready(messages, batch, Instant::now());
                if !ready.is_empty() {
                    return Ok(ready
                        .into_iter()
                        .map(|m| {
                            Box::new(MockDelivery {
                                shared: Arc::clone(&self.shared),
                                stream: self.stream.clone(),
                                consumer: self.consumer.clone(),
                                seq: m.seq,
                                subject: m.subject,
                                payload: m.payload,
                                deliveries: m.deliveries,
                            }) as Box<dyn Delivery>
                        })
                        .collect());
                }
                consumer.next_redelivery()
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(FetchError::Timeout);
            }
            let wake = next_redelivery.map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.shared.state.lock().await.fail_on_unsubscribe {
            return Err(BrokerError::Request(format!(
                "mock unsubscribe failure for {}",
                self.consumer
            )));
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MockDelivery {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    seq: u64,
    subject: String,
    payload: Bytes,
    deliveries: u64,
}

impl MockDelivery {
    async fn settle(&self, redeliver: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            let consumer = state
                .streams
                .get_mut(&self.stream)
                .and_then(|s| s.consumers.get_mut(&self.consumer))
                .ok_or_else(|| BrokerError::NotFound {
                    kind: "consumer",
                    name: self.consumer.clone(),
                })?;

            if redeliver {
                if let Some(pending) = consumer.pending.get_mut(&self.seq) {
                    pending.redeliver_at = Instant::now();
                }
            } else {
                consumer.pending.remove(&self.seq);
            }
        }
        if redeliver {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivery_count(&self) -> u64 {
        self.deliveries
    }

    async fn ack(&self) -> Result<()> {
        self.settle(false).await
    }

    async fn nak(&self) -> Result<()> {
        self.settle(true).await
    }
}

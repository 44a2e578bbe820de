//! Stream and durable consumer provisioning.
//!
//! Provisioning is create-if-absent: an existing stream is never mutated, and
//! configuration drift against it is only reported.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, ConsumerSpec, CreateOutcome, StreamInfo, StreamSpec};
use crate::config::ConsumerConfig;
use crate::events::Topic;

/// Errors during stream or consumer provisioning.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to ensure stream {stream}: {source}")]
    Stream {
        stream: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to ensure consumer {consumer} for {topic}: {source}")]
    Consumer {
        topic: String,
        consumer: String,
        #[source]
        source: BrokerError,
    },
}

/// How existing broker objects are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisionPolicy {
    /// Create when missing; leave existing objects untouched and log drift.
    #[default]
    CreateIfAbsent,
}

/// Result of an ensure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Existing,
}

impl From<CreateOutcome> for EnsureOutcome {
    fn from(outcome: CreateOutcome) -> Self {
        match outcome {
            CreateOutcome::Created => EnsureOutcome::Created,
            CreateOutcome::AlreadyExists => EnsureOutcome::Existing,
        }
    }
}

/// Durable name for a topic: `{base}-{topic}` with wildcards spelled out.
///
/// `events.match.found` under base `parser` becomes `parser-events-match-found`.
pub fn durable_name(base: &str, topic: &str) -> String {
    let topic = topic
        .split('.')
        .map(|token| match token {
            "*" => "any",
            ">" => "all",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("-");
    format!("{}-{}", base, topic)
}

/// Fields of a live stream that differ from the requested definition.
fn stream_drift(requested: &StreamSpec, live: &StreamInfo) -> Vec<&'static str> {
    let mut drift = Vec::new();
    let mut live_subjects = live.config.subjects.clone();
    let mut wanted_subjects = requested.subjects.clone();
    live_subjects.sort();
    wanted_subjects.sort();

    if live_subjects != wanted_subjects {
        drift.push("subjects");
    }
    if live.config.max_age != requested.max_age {
        drift.push("max_age");
    }
    if live.config.max_messages != requested.max_messages {
        drift.push("max_messages");
    }
    if live.config.replicas != requested.replicas {
        drift.push("replicas");
    }
    drift
}

/// Ensures the event stream and per-topic durable consumers exist.
#[derive(Clone)]
pub struct StreamProvisioner {
    broker: Arc<dyn Broker>,
    stream: StreamSpec,
    consumer: ConsumerConfig,
    policy: ProvisionPolicy,
}

impl StreamProvisioner {
    pub fn new(broker: Arc<dyn Broker>, stream: StreamSpec, consumer: ConsumerConfig) -> Self {
        Self {
            broker,
            stream,
            consumer,
            policy: ProvisionPolicy::default(),
        }
    }

    pub fn policy(&self) -> ProvisionPolicy {
        self.policy
    }

    pub fn stream_name(&self) -> &str {
        &self.stream.name
    }

    /// Durable consumer name used for `topic`.
    pub fn durable_for(&self, topic: Topic) -> String {
        durable_name(self.consumer.durable_base(), topic.subject())
    }

    /// Consumer definition used for `topic`.
    pub fn consumer_spec(&self, topic: Topic) -> ConsumerSpec {
        ConsumerSpec {
            durable_name: self.durable_for(topic),
            filter_subject: topic.subject().to_string(),
            ack_wait: self.consumer.ack_wait(),
            max_deliver: self.consumer.max_deliver,
            max_ack_pending: self.consumer.max_ack_pending,
            description: Some(format!("{} consumer for {}", self.consumer.name, topic)),
        }
    }

    /// Create the stream unless it already exists.
    pub async fn ensure_stream(&self) -> Result<EnsureOutcome, ProvisionError> {
        let stream_err = |source| ProvisionError::Stream {
            stream: self.stream.name.clone(),
            source,
        };

        match self.broker.stream_info(&self.stream.name).await.map_err(stream_err)? {
            Some(live) => {
                let drift = stream_drift(&self.stream, &live);
                if drift.is_empty() {
                    debug!(stream = %self.stream.name, "Stream exists");
                } else {
                    warn!(
                        stream = %self.stream.name,
                        fields = ?drift,
                        "Existing stream differs from configuration; leaving it unchanged"
                    );
                }
                Ok(EnsureOutcome::Existing)
            }
            None => {
                self.broker
                    .create_stream(&self.stream)
                    .await
                    .map_err(stream_err)?;
                info!(
                    stream = %self.stream.name,
                    subjects = ?self.stream.subjects,
                    "Created stream"
                );
                Ok(EnsureOutcome::Created)
            }
        }
    }

    /// Create the durable consumer for `topic`, or find the existing one.
    pub async fn ensure_consumer(
        &self,
        topic: Topic,
    ) -> Result<(String, EnsureOutcome), ProvisionError> {
        let spec = self.consumer_spec(topic);
        let outcome = self
            .broker
            .create_consumer(&self.stream.name, &spec)
            .await
            .map_err(|source| ProvisionError::Consumer {
                topic: topic.subject().to_string(),
                consumer: spec.durable_name.clone(),
                source,
            })?;

        match outcome {
            CreateOutcome::Created => {
                info!(consumer = %spec.durable_name, topic = %topic, "Created durable consumer")
            }
            CreateOutcome::AlreadyExists => {
                debug!(consumer = %spec.durable_name, topic = %topic, "Binding existing durable consumer")
            }
        }
        Ok((spec.durable_name, outcome.into()))
    }

    /// Delete and recreate the durable consumer for `topic`.
    ///
    /// A consumer that is already gone is not an error; any other delete
    /// failure is, and nothing is recreated.
    pub async fn recreate_consumer(&self, topic: Topic) -> Result<(), ProvisionError> {
        let durable = self.durable_for(topic);

        match self.broker.delete_consumer(&self.stream.name, &durable).await {
            Ok(true) => debug!(consumer = %durable, "Deleted consumer"),
            Ok(false) => debug!(consumer = %durable, "Consumer already absent"),
            Err(source) => {
                warn!(consumer = %durable, error = %source, "Failed to delete consumer");
                return Err(ProvisionError::Consumer {
                    topic: topic.subject().to_string(),
                    consumer: durable,
                    source,
                });
            }
        }

        self.ensure_consumer(topic).await?;
        info!(consumer = %durable, topic = %topic, "Recreated consumer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::MockBroker;
    use crate::config::StreamConfig;

    fn provisioner(broker: &MockBroker) -> StreamProvisioner {
        let mut consumer = ConsumerConfig::default();
        consumer.name = "arbitrage".to_string();
        StreamProvisioner::new(
            Arc::new(broker.clone()),
            StreamConfig::default().to_spec(),
            consumer,
        )
    }

    #[test]
    fn test_durable_name_replaces_separators() {
        assert_eq!(
            durable_name("parser", "events.match.found"),
            "parser-events-match-found"
        );
        assert_eq!(durable_name("svc", "events.*.found"), "svc-events-any-found");
        assert_eq!(durable_name("svc", "events.>"), "svc-events-all");
    }

    #[test]
    fn test_durable_name_uses_group() {
        let mut consumer = ConsumerConfig::default();
        consumer.group = Some("notifiers".to_string());
        let provisioner = StreamProvisioner::new(
            Arc::new(MockBroker::new()),
            StreamConfig::default().to_spec(),
            consumer,
        );
        assert_eq!(
            provisioner.durable_for(Topic::ForkFound),
            "notifiers-events-fork-found"
        );
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let broker = MockBroker::new();
        let provisioner = provisioner(&broker);

        assert_eq!(provisioner.policy(), ProvisionPolicy::CreateIfAbsent);
        assert_eq!(
            provisioner.ensure_stream().await.unwrap(),
            EnsureOutcome::Created
        );
        assert_eq!(
            provisioner.ensure_stream().await.unwrap(),
            EnsureOutcome::Existing
        );
    }

    #[tokio::test]
    async fn test_ensure_stream_leaves_drifted_stream_untouched() {
        let broker = MockBroker::new();
        let mut existing = StreamConfig::default().to_spec();
        existing.max_age = Duration::from_secs(60);
        broker.create_stream(&existing).await.unwrap();

        let outcome = provisioner(&broker).ensure_stream().await.unwrap();

        assert_eq!(outcome, EnsureOutcome::Existing);
        let live = broker.stream_info("EVENTS").await.unwrap().unwrap();
        assert_eq!(live.config.max_age, Duration::from_secs(60));
    }

    #[test]
    fn test_stream_drift_detection() {
        let requested = StreamConfig::default().to_spec();
        let mut live = StreamInfo {
            config: requested.clone(),
            messages: 0,
            bytes: 0,
        };
        assert!(stream_drift(&requested, &live).is_empty());

        live.config.replicas = 3;
        live.config.subjects = vec!["other.>".to_string()];
        assert_eq!(stream_drift(&requested, &live), vec!["subjects", "replicas"]);
    }

    #[tokio::test]
    async fn test_ensure_stream_fails_when_disconnected() {
        let broker = MockBroker::new();
        broker.set_session_state(crate::broker::SessionState::Reconnecting);

        let result = provisioner(&broker).ensure_stream().await;

        assert!(matches!(
            result,
            Err(ProvisionError::Stream {
                source: BrokerError::NotConnected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_ensure_consumer_creates_then_binds() {
        let broker = MockBroker::new();
        let provisioner = provisioner(&broker);
        provisioner.ensure_stream().await.unwrap();

        let (name, first) = provisioner.ensure_consumer(Topic::MatchFound).await.unwrap();
        let (_, second) = provisioner.ensure_consumer(Topic::MatchFound).await.unwrap();

        assert_eq!(name, "arbitrage-events-match-found");
        assert_eq!(first, EnsureOutcome::Created);
        assert_eq!(second, EnsureOutcome::Existing);

        let spec = broker.consumer_spec("EVENTS", &name).await.unwrap();
        assert_eq!(spec.filter_subject, "events.match.found");
        assert_eq!(spec.max_deliver, 5);
        assert_eq!(spec.ack_wait, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_ensure_consumer_without_stream_fails() {
        let broker = MockBroker::new();
        let result = provisioner(&broker).ensure_consumer(Topic::Errors).await;
        assert!(matches!(result, Err(ProvisionError::Consumer { .. })));
    }

    #[tokio::test]
    async fn test_recreate_consumer_tolerates_missing() {
        let broker = MockBroker::new();
        let provisioner = provisioner(&broker);
        provisioner.ensure_stream().await.unwrap();

        provisioner.recreate_consumer(Topic::Errors).await.unwrap();

        assert_eq!(
            broker.consumer_names("EVENTS").await,
            vec!["arbitrage-events-errors"]
        );
    }

    #[tokio::test]
    async fn test_recreate_consumer_fails_when_delete_fails() {
        let broker = MockBroker::new();
        let provisioner = provisioner(&broker);
        provisioner.ensure_stream().await.unwrap();
        provisioner.ensure_consumer(Topic::Errors).await.unwrap();
        broker.set_fail_on_delete_consumer(true).await;

        let result = provisioner.recreate_consumer(Topic::Errors).await;

        match result {
            Err(ProvisionError::Consumer { consumer, .. }) => {
                assert_eq!(consumer, "arbitrage-events-errors")
            }
            other => panic!("expected consumer error, got {:?}", other),
        }
        assert_eq!(
            broker.consumer_names("EVENTS").await,
            vec!["arbitrage-events-errors"]
        );
    }
}

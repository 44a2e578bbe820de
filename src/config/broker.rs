//! Broker connection, stream and consumer configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::StreamSpec;
use crate::events::topics::STREAM_EVENTS;

/// NATS connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Client certificate for mutual TLS.
    pub tls_cert_file: Option<PathBuf>,
    /// Private key matching `tls_cert_file`.
    pub tls_key_file: Option<PathBuf>,
    /// CA bundle used to verify the server.
    pub tls_ca_file: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Fixed delay between reconnect attempts.
    pub reconnect_wait_ms: u64,
    /// Negative means retry forever.
    pub max_reconnects: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            user: None,
            password: None,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            reconnect_wait_ms: 1_000,
            max_reconnects: -1,
        }
    }
}

impl NatsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    /// Reconnect limit, `None` when unbounded.
    pub fn reconnect_limit(&self) -> Option<usize> {
        usize::try_from(self.max_reconnects).ok()
    }

    /// Whether any TLS material is configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file.is_some() || self.tls_key_file.is_some() || self.tls_ca_file.is_some()
    }
}

/// Event stream configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age_secs: u64,
    pub max_messages: i64,
    pub replicas: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: STREAM_EVENTS.to_string(),
            subjects: vec!["events.>".to_string()],
            max_age_secs: 24 * 60 * 60,
            max_messages: 100_000,
            replicas: 1,
        }
    }
}

impl StreamConfig {
    pub fn to_spec(&self) -> StreamSpec {
        StreamSpec {
            name: self.name.clone(),
            subjects: self.subjects.clone(),
            max_age: Duration::from_secs(self.max_age_secs),
            max_messages: self.max_messages,
            replicas: self.replicas,
        }
    }
}

/// Durable consumer configuration shared by every subscription of a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub name: String,
    /// When set, instances sharing the group share durable consumers.
    pub group: Option<String>,
    pub ack_wait_secs: u64,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
    pub pull_batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "default-consumer".to_string(),
            group: None,
            ack_wait_secs: 30,
            max_deliver: 5,
            max_ack_pending: 256,
            pull_batch_size: 100,
            poll_interval_ms: 100,
        }
    }
}

impl ConsumerConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Prefix of every durable name: the group if set, else the consumer name.
    pub fn durable_base(&self) -> &str {
        self.group
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(&self.name)
    }
}

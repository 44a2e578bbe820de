//! surebet-bus - JetStream client runtime for surebet domain events
//!
//! Publishes typed events (matches, odds, forks, errors, health checks,
//! alerts) to a NATS JetStream stream and consumes them through durable pull
//! consumers, one dispatch loop per subscribed topic, with explicit
//! ack/nak and a bounded graceful shutdown.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use surebet_bus::{Client, Config, Publisher};
//!
//! let client = Client::connect(Config::load(None)?).await?;
//! client.publish_error("parser", "scrape", "upstream timeout", false).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod events;
pub mod provision;
pub mod utils;

pub use broker::{Broker, BrokerError, MockBroker, SessionState};
#[cfg(feature = "nats")]
pub use broker::{ConnectionError, NatsBroker};
pub use client::{Client, ClientError, ClientStats, Consumer, HealthError, PublishError, Publisher};
pub use config::{Config, ConfigError};
pub use consumer::{EventHandler, HandlerError, SubscriptionError};
pub use events::{Envelope, EventCodec, EventHeader, EventKind, EventPayload, Topic};
pub use provision::{ProvisionError, ProvisionPolicy, StreamProvisioner};

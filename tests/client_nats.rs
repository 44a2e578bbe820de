//! NATS JetStream client integration tests using testcontainers.
//!
//! Run with: cargo test --test client_nats -- --nocapture
//!
//! These tests spin up NATS with JetStream in a container using testcontainers-rs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use surebet_bus::events::{ErrorPayload, Fork, Match, Odds, SportType};
use surebet_bus::{
    Broker, Client, Config, Consumer, EventHandler, EventHeader, HandlerError, HealthError,
    NatsBroker, Publisher, SessionState,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start NATS container with JetStream enabled.
async fn start_nats() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js"]); // Enable JetStream

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("nats://{}:{}", host, host_port);
    println!("NATS available at: {}", url);

    (container, url)
}

fn config_for(url: &str, service: &str) -> Config {
    let mut config = Config::for_test(service);
    config.nats.url = url.to_string();
    config.consumer.name = format!("{}-consumer", service);
    config
}

/// Handler that forwards matches and forks; optionally fails every call.
struct CapturingHandler {
    tx: mpsc::UnboundedSender<String>,
    calls: AtomicUsize,
    fail: bool,
}

impl CapturingHandler {
    fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            tx,
            calls: AtomicUsize::new(0),
            fail,
        });
        (handler, rx)
    }

    fn capture(&self, id: &str) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(id.to_string());
        if self.fail {
            return Err(HandlerError::new("rejected by test"));
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for CapturingHandler {
    async fn handle_match_found(
        &self,
        _header: &EventHeader,
        event: &Match,
    ) -> Result<(), HandlerError> {
        self.capture(&event.teams.join(" vs "))
    }

    async fn handle_odds_updated(
        &self,
        _header: &EventHeader,
        _event: &Odds,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle_fork_found(
        &self,
        _header: &EventHeader,
        event: &Fork,
    ) -> Result<(), HandlerError> {
        self.capture(&event.id)
    }

    async fn handle_error(
        &self,
        _header: &EventHeader,
        _event: &ErrorPayload,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn make_match() -> Match {
    Match {
        id: uuid::Uuid::new_v4().to_string(),
        external_id: "ext".to_string(),
        sport: SportType::CounterStrike,
        teams: vec!["NaVi".to_string(), "G2".to_string()],
        starts_at: Utc::now(),
        url: None,
    }
}

fn make_fork(id: &str) -> Fork {
    Fork {
        id: id.to_string(),
        match_id: "m-1".to_string(),
        sport: SportType::Valorant,
        teams: vec!["Fnatic".to_string(), "Sentinels".to_string()],
        profit: 5.0,
        profit_percentage: 0.8,
        arbitrage: vec![],
        detected_at: Utc::now(),
        notification: false,
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed")
}

#[tokio::test]
async fn test_publish_subscribe_roundtrip() {
    println!("=== test_publish_subscribe_roundtrip ===");
    let (_container, url) = start_nats().await;

    let publisher = Client::connect(config_for(&url, "parser"))
        .await
        .expect("Failed to connect publisher");
    let subscriber = Client::connect(config_for(&url, "arbitrage"))
        .await
        .expect("Failed to connect subscriber");

    let (handler, mut rx) = CapturingHandler::new(false);
    subscriber
        .subscribe_to_matches(handler)
        .await
        .expect("Failed to subscribe");

    publisher
        .publish_match_found(make_match())
        .await
        .expect("Failed to publish");

    assert_eq!(recv(&mut rx).await, "NaVi vs G2");

    publisher.close().await.expect("Failed to close publisher");
    subscriber.close().await.expect("Failed to close subscriber");
    println!("  PASSED");
}

#[tokio::test]
async fn test_stream_provisioning_is_idempotent() {
    println!("=== test_stream_provisioning_is_idempotent ===");
    let (_container, url) = start_nats().await;

    let first = Client::connect(config_for(&url, "parser"))
        .await
        .expect("First client failed");
    first
        .publish_error("parser", "scrape", "timeout", false)
        .await
        .expect("Failed to publish");

    let second = Client::connect(config_for(&url, "monitor"))
        .await
        .expect("Second client failed");

    second.health_check().await.expect("Health check failed");
    let stats = second.stats().await;
    assert!(stats.is_connected);
    assert_eq!(stats.stream_messages, Some(1));

    first.close().await.unwrap();
    second.close().await.unwrap();
    println!("  PASSED");
}

#[tokio::test]
async fn test_new_consumer_delivers_only_new_messages() {
    println!("=== test_new_consumer_delivers_only_new_messages ===");
    let (_container, url) = start_nats().await;
    let client = Client::connect(config_for(&url, "notifier"))
        .await
        .expect("Failed to connect");

    client
        .publish_fork_found(make_fork("before"))
        .await
        .expect("Failed to publish");

    let (handler, mut rx) = CapturingHandler::new(false);
    client
        .subscribe_to_forks(handler)
        .await
        .expect("Failed to subscribe");

    client
        .publish_fork_found(make_fork("after"))
        .await
        .expect("Failed to publish");

    assert_eq!(recv(&mut rx).await, "after");
    let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(extra.is_err(), "history must not be delivered");

    client.close().await.unwrap();
    println!("  PASSED");
}

#[tokio::test]
async fn test_nak_redelivers_up_to_max_deliver() {
    println!("=== test_nak_redelivers_up_to_max_deliver ===");
    let (_container, url) = start_nats().await;
    let mut config = config_for(&url, "arbitrage");
    config.consumer.max_deliver = 3;
    config.consumer.ack_wait_secs = 1;
    let client = Client::connect(config).await.expect("Failed to connect");

    let (handler, mut rx) = CapturingHandler::new(true);
    client
        .subscribe_to_forks(handler.clone())
        .await
        .expect("Failed to subscribe");
    client
        .publish_fork_found(make_fork("poison"))
        .await
        .expect("Failed to publish");

    for _ in 0..3 {
        assert_eq!(recv(&mut rx).await, "poison");
    }
    let extra = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
    assert!(extra.is_err(), "delivered more than max_deliver times");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    client.close().await.unwrap();
    println!("  PASSED");
}

#[tokio::test]
async fn test_consumer_group_shares_durable_consumer() {
    println!("=== test_consumer_group_shares_durable_consumer ===");
    let (_container, url) = start_nats().await;

    let mut config_a = config_for(&url, "notifier-a");
    config_a.consumer.group = Some("notifiers".to_string());
    let mut config_b = config_for(&url, "notifier-b");
    config_b.consumer.group = Some("notifiers".to_string());

    let a = Client::connect(config_a).await.expect("Client a failed");
    let b = Client::connect(config_b).await.expect("Client b failed");

    let (handler, mut rx) = CapturingHandler::new(false);
    a.subscribe_to_forks(handler.clone()).await.unwrap();
    b.subscribe_to_forks(handler.clone()).await.unwrap();

    for i in 0..4 {
        a.publish_fork_found(make_fork(&format!("fork-{}", i)))
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(recv(&mut rx).await);
    }
    received.sort();
    assert_eq!(received, vec!["fork-0", "fork-1", "fork-2", "fork-3"]);

    let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(extra.is_err(), "group members must not both receive a message");

    a.close().await.unwrap();
    b.close().await.unwrap();
    println!("  PASSED");
}

#[tokio::test]
async fn test_close_is_bounded_and_idempotent() {
    println!("=== test_close_is_bounded_and_idempotent ===");
    let (_container, url) = start_nats().await;
    let client = Client::connect(config_for(&url, "monitor"))
        .await
        .expect("Failed to connect");

    let (handler, _rx) = CapturingHandler::new(false);
    client.subscribe_to_matches(handler.clone()).await.unwrap();
    client.subscribe_to_forks(handler).await.unwrap();

    let started = std::time::Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    client.close().await.unwrap();
    assert!(!client.is_connected().await);
    assert!(matches!(client.health_check().await, Err(HealthError::Closed)));
    println!("  PASSED");
}

#[tokio::test]
async fn test_close_drains_nats_connection() {
    println!("=== test_close_drains_nats_connection ===");
    let (_container, url) = start_nats().await;
    let config = config_for(&url, "monitor");
    let broker = Arc::new(
        NatsBroker::connect(&config.nats)
            .await
            .expect("Failed to connect"),
    );
    let client = Client::with_broker(config, broker.clone())
        .await
        .expect("Failed to build client");

    client.close().await.unwrap();
    assert_eq!(broker.session_state(), SessionState::Closed);

    // Once drained the connection handler exits and the client rejects commands.
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while broker.client().flush().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "connection still alive after close");
    println!("  PASSED");
}

#[tokio::test]
async fn test_deleted_consumer_is_recreated() {
    println!("=== test_deleted_consumer_is_recreated ===");
    let (_container, url) = start_nats().await;
    let config = config_for(&url, "notifier");
    let broker = Arc::new(
        NatsBroker::connect(&config.nats)
            .await
            .expect("Failed to connect"),
    );
    let client = Client::with_broker(config, broker.clone())
        .await
        .expect("Failed to build client");

    let (handler, mut rx) = CapturingHandler::new(false);
    client.subscribe_to_forks(handler).await.unwrap();

    let durable = "notifier-consumer-events-fork-found";
    assert!(broker.delete_consumer("EVENTS", durable).await.unwrap());

    // The loop recreates the consumer with deliver-new, so keep publishing
    // until one message lands on the new consumer.
    let received = tokio::time::timeout(Duration::from_secs(20), async {
        let mut attempt = 0;
        loop {
            attempt += 1;
            client
                .publish_fork_found(make_fork(&format!("retry-{}", attempt)))
                .await
                .unwrap();
            if let Ok(Some(id)) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            {
                return id;
            }
        }
    })
    .await
    .expect("consumer was not recreated");
    assert!(received.starts_with("retry-"));

    client.close().await.unwrap();
    println!("  PASSED");
}

//! surebet-subscribe: test subscriber
//!
//! Subscribes to `events.match.found` and prints every match until Ctrl+C.
//!
//! ## Configuration
//! - SUREBET_CONFIG: Path to a YAML config file (optional)
//! - NATS_URL, CONSUMER_NAME, CONSUMER_GROUP, ...: legacy overrides
//! - SUREBET_LOG: Log filter (defaults to the configured log level)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use surebet_bus::events::{ErrorPayload, Fork, Match, Odds};
use surebet_bus::utils::bootstrap::init_tracing;
use surebet_bus::{Client, Config, Consumer, EventHandler, EventHeader, HandlerError};

/// Prints matches to stdout; every other kind is accepted silently.
struct PrintingHandler;

#[async_trait]
impl EventHandler for PrintingHandler {
    async fn handle_match_found(
        &self,
        header: &EventHeader,
        event: &Match,
    ) -> Result<(), HandlerError> {
        println!(
            "match {} [{}] {} at {}",
            event.id,
            event.sport,
            event.teams.join(" vs "),
            header.timestamp
        );
        Ok(())
    }

    async fn handle_odds_updated(&self, _: &EventHeader, _: &Odds) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle_fork_found(&self, _: &EventHeader, _: &Fork) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle_error(&self, _: &EventHeader, _: &ErrorPayload) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(None)?;
    init_tracing(&config.log_level, &config.environment);

    let client = Client::connect(config).await?;
    client.subscribe_to_matches(Arc::new(PrintingHandler)).await?;

    info!("Subscriber running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    client.close().await?;
    Ok(())
}

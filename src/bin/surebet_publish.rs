//! surebet-publish: test publisher
//!
//! Publishes one `match.found` event and exits.
//!
//! ## Usage
//! ```text
//! surebet-publish [TEAM_A TEAM_B]
//! ```
//! Teams default to NaVi vs G2.
//!
//! ## Configuration
//! - SUREBET_CONFIG: Path to a YAML config file (optional)
//! - NATS_URL, SERVICE_NAME, ...: legacy overrides
//! - SUREBET_LOG: Log filter (defaults to the configured log level)

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use surebet_bus::events::{Match, SportType};
use surebet_bus::utils::bootstrap::init_tracing;
use surebet_bus::{Client, Config, Publisher};

const DEFAULT_TEAMS: [&str; 2] = ["NaVi", "G2"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(None)?;
    init_tracing(&config.log_level, &config.environment);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let teams = match args.as_slice() {
        [home, away, ..] => vec![home.clone(), away.clone()],
        _ => DEFAULT_TEAMS.iter().map(|t| t.to_string()).collect(),
    };

    let client = Client::connect(config).await?;

    let event = Match {
        id: Uuid::new_v4().to_string(),
        external_id: String::new(),
        sport: SportType::CounterStrike,
        teams,
        starts_at: Utc::now(),
        url: None,
    };
    let id = event.id.clone();
    let result = client.publish_match_found(event).await;
    client.close().await?;
    result?;

    info!(match_id = %id, "Published match");
    Ok(())
}

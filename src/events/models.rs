//! Domain models carried as event payloads.
//!
//! Field names follow the JSON contract shared with the other surebet
//! services; do not rename them without bumping the protocol version.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares a string-valued enum that round-trips unknown values through an
/// `Other` variant, so a newer producer never breaks an older consumer.
macro_rules! open_string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $value,)+
                    $name::Other(s) => s.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($value => $name::$variant,)+
                    _ => $name::Other(value),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(s) => s,
                    other => other.as_str().to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

open_string_enum! {
    /// Esports discipline.
    SportType {
        CounterStrike => "counter-strike",
        Dota2 => "dota2",
        LeagueOfLegends => "league-of-legends",
        Valorant => "valorant",
        RainbowSix => "rainbow-six",
    }
}

open_string_enum! {
    /// Bookmaker the odds were scraped from.
    Bookmaker {
        Parivision => "parivision",
        Fonbet => "fonbet",
        OlimpBet => "olimp-bet",
        BetBoom => "bet-boom",
        Winline => "winline",
    }
}

open_string_enum! {
    /// Betting market kind.
    MarketType {
        MatchWinner => "match-winner",
        TotalMaps => "total-maps",
        Handicap => "handicap",
        MainTotal => "main-total",
        Painting => "painting",
    }
}

/// One priced outcome of a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(rename = "name")]
    pub bet_title: String,
    pub less: f64,
    pub more: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    #[serde(rename = "type")]
    pub market_type: MarketType,
    pub name: String,
    pub outcomes: Vec<Outcome>,
    pub updated_at: DateTime<Utc>,
}

/// A match discovered by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub external_id: String,
    pub sport: SportType,
    pub teams: Vec<String>,
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Odds snapshot for one match at one bookmaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Odds {
    pub match_id: String,
    pub bookmaker: Bookmaker,
    pub markets: Vec<Market>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageLeg {
    pub bookmaker: Bookmaker,
    pub market: Market,
    pub outcome: Outcome,
    pub stake: f64,
    pub profit: f64,
    pub profit_percentage: f64,
}

/// An arbitrage opportunity across bookmakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fork {
    pub id: String,
    pub match_id: String,
    pub sport: SportType,
    pub teams: Vec<String>,
    pub profit: f64,
    pub profit_percentage: f64,
    pub arbitrage: Vec<ArbitrageLeg>,
    pub detected_at: DateTime<Utc>,
    pub notification: bool,
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub service: String,
    pub operation: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub is_critical: bool,
    pub recoverable: bool,
}

impl ErrorPayload {
    /// Build an error report; non-critical errors are marked recoverable.
    pub fn new(
        service: impl Into<String>,
        operation: impl Into<String>,
        error: impl Into<String>,
        critical: bool,
    ) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            error: error.into(),
            stack: None,
            is_critical: critical,
            recoverable: !critical,
        }
    }
}

/// Payload of a `health.check` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckPayload {
    pub service: String,
    /// `healthy` or `unhealthy`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, serde_json::Value>>,
}

/// Payload of an `alert.created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub fork_id: String,
    /// Delivery channel (telegram, web, ...).
    pub channel: String,
    pub message: String,
    /// low, medium or high.
    pub priority: String,
    pub created_at: DateTime<Utc>,
}

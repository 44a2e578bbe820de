//! Subject names, stream defaults and protocol constants.

use std::fmt;

use super::EventKind;

/// Subject for newly discovered matches.
pub const TOPIC_MATCH_FOUND: &str = "events.match.found";
/// Subject for bookmaker odds snapshots.
pub const TOPIC_ODDS_UPDATED: &str = "events.odds.updated";
/// Subject for detected arbitrage forks.
pub const TOPIC_FORK_FOUND: &str = "events.fork.found";
/// Subject for notification alerts.
pub const TOPIC_ALERTS: &str = "events.alerts";
/// Subject for service error reports.
pub const TOPIC_ERRORS: &str = "events.errors";
/// Subject for service health reports.
pub const TOPIC_HEALTH: &str = "events.health";

/// Default stream holding every `events.>` subject.
pub const STREAM_EVENTS: &str = "EVENTS";

/// Protocol version stamped into every envelope header.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// A topic this client publishes to or subscribes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MatchFound,
    OddsUpdated,
    ForkFound,
    Alerts,
    Errors,
    Health,
}

impl Topic {
    /// All known topics.
    pub const ALL: [Topic; 6] = [
        Topic::MatchFound,
        Topic::OddsUpdated,
        Topic::ForkFound,
        Topic::Alerts,
        Topic::Errors,
        Topic::Health,
    ];

    /// Broker subject for this topic.
    pub fn subject(&self) -> &'static str {
        match self {
            Topic::MatchFound => TOPIC_MATCH_FOUND,
            Topic::OddsUpdated => TOPIC_ODDS_UPDATED,
            Topic::ForkFound => TOPIC_FORK_FOUND,
            Topic::Alerts => TOPIC_ALERTS,
            Topic::Errors => TOPIC_ERRORS,
            Topic::Health => TOPIC_HEALTH,
        }
    }

    /// The single event kind carried on this topic.
    pub fn event_kind(&self) -> EventKind {
        match self {
            Topic::MatchFound => EventKind::MatchFound,
            Topic::OddsUpdated => EventKind::OddsUpdated,
            Topic::ForkFound => EventKind::ForkFound,
            Topic::Alerts => EventKind::AlertCreated,
            Topic::Errors => EventKind::Error,
            Topic::Health => EventKind::HealthCheck,
        }
    }

    /// Topic an event kind is published to.
    pub fn for_kind(kind: EventKind) -> Topic {
        match kind {
            EventKind::MatchFound => Topic::MatchFound,
            EventKind::OddsUpdated => Topic::OddsUpdated,
            EventKind::ForkFound => Topic::ForkFound,
            EventKind::AlertCreated => Topic::Alerts,
            EventKind::Error => Topic::Errors,
            EventKind::HealthCheck => Topic::Health,
        }
    }

    /// Look up a topic by its subject.
    pub fn from_subject(subject: &str) -> Option<Topic> {
        Self::ALL.into_iter().find(|t| t.subject() == subject)
    }

    /// Whether `EventHandler` has a method for this topic's events.
    pub fn is_subscribable(&self) -> bool {
        matches!(
            self,
            Topic::MatchFound | Topic::OddsUpdated | Topic::ForkFound | Topic::Errors
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subject())
    }
}

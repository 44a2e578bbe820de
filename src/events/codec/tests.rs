use super::*;
use crate::events::models::{ErrorPayload, Fork, HealthCheckPayload, Match, SportType};

fn codec() -> EventCodec {
    EventCodec::for_service("parser")
}

fn sample_match() -> Match {
    Match {
        id: "abc-123".to_string(),
        external_id: "hltv-42".to_string(),
        sport: SportType::CounterStrike,
        teams: vec!["NaVi".to_string(), "G2".to_string()],
        starts_at: Utc::now(),
        url: Some("https://example.test/m/42".to_string()),
    }
}

fn sample_fork() -> Fork {
    Fork {
        id: "fork-1".to_string(),
        match_id: "abc-123".to_string(),
        sport: SportType::Dota2,
        teams: vec!["Liquid".to_string(), "OG".to_string()],
        profit: 12.5,
        profit_percentage: 2.1,
        arbitrage: vec![],
        detected_at: Utc::now(),
        notification: true,
    }
}

#[test]
fn test_match_round_trip() {
    let codec = codec();
    let payload = EventPayload::MatchFound(sample_match());
    let bytes = codec.encode(payload.clone(), Some("corr-1")).unwrap();

    let envelope = codec.decode(&bytes, EventKind::MatchFound).unwrap();

    assert_eq!(envelope.payload(), &payload);
    assert_eq!(envelope.header().source, "parser");
    assert_eq!(envelope.header().version, PROTOCOL_VERSION);
    assert_eq!(envelope.correlation_id(), Some("corr-1"));
}

#[test]
fn test_every_kind_round_trips() {
    let codec = codec();
    let payloads = vec![
        EventPayload::MatchFound(sample_match()),
        EventPayload::ForkFound(sample_fork()),
        EventPayload::Error(ErrorPayload::new("parser", "scrape", "timeout", true)),
        EventPayload::HealthCheck(HealthCheckPayload {
            service: "parser".to_string(),
            status: "healthy".to_string(),
            message: None,
            metrics: None,
        }),
    ];

    for payload in payloads {
        let kind = payload.kind();
        let bytes = codec.encode(payload.clone(), None).unwrap();
        let envelope = codec.decode(&bytes, kind).unwrap();
        assert_eq!(envelope.kind(), kind);
        assert_eq!(envelope.payload(), &payload);
    }
}

#[test]
fn test_event_ids_are_unique_for_identical_input() {
    let codec = codec();
    let now = Utc::now();
    let payload = EventPayload::MatchFound(sample_match());

    let first = codec.build_at(payload.clone(), None, now);
    let second = codec.build_at(payload, None, now);

    assert_eq!(first.header().timestamp, second.header().timestamp);
    assert_ne!(first.event_id(), second.event_id());
}

#[test]
fn test_header_is_flattened_on_the_wire() {
    let codec = codec();
    let bytes = codec
        .encode(EventPayload::MatchFound(sample_match()), None)
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(json["event_type"], "match.found");
    assert_eq!(json["payload"]["teams"][1], "G2");
    assert!(json.get("correlation_id").is_none());
}

#[test]
fn test_empty_correlation_id_is_dropped() {
    let envelope = codec().build(EventPayload::ForkFound(sample_fork()), Some(""));
    assert_eq!(envelope.correlation_id(), None);
}

#[test]
fn test_decode_garbage_is_malformed() {
    let err = codec().decode(b"not json", EventKind::MatchFound).unwrap_err();
    assert!(matches!(err, DecodeError::Malformed(_)));
}

#[test]
fn test_decode_unknown_kind() {
    let bytes = br#"{"event_id":"1","event_type":"bet.placed","timestamp":"2026-01-01T00:00:00Z","source":"x","version":"1.0.0","payload":{}}"#;
    let err = codec().decode(bytes, EventKind::MatchFound).unwrap_err();
    assert!(matches!(err, DecodeError::UnknownKind(tag) if tag == "bet.placed"));
}

#[test]
fn test_decode_kind_mismatch() {
    let codec = codec();
    let bytes = codec
        .encode(EventPayload::ForkFound(sample_fork()), None)
        .unwrap();

    let err = codec.decode(&bytes, EventKind::MatchFound).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::KindMismatch {
            expected: EventKind::MatchFound,
            actual: EventKind::ForkFound
        }
    ));
}

#[test]
fn test_decode_payload_schema_violation() {
    let bytes = br#"{"event_id":"1","event_type":"match.found","timestamp":"2026-01-01T00:00:00Z","source":"x","version":"1.0.0","payload":{"id":42}}"#;
    let err = codec().decode(bytes, EventKind::MatchFound).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::Payload {
            kind: EventKind::MatchFound,
            ..
        }
    ));
}

#[test]
fn test_decode_ignores_unknown_fields() {
    let bytes = br#"{"event_id":"1","event_type":"health.check","timestamp":"2026-01-01T00:00:00Z","source":"x","version":"1.1.0","shard":7,"payload":{"service":"x","status":"healthy","uptime":3}}"#;
    let envelope = codec().decode(bytes, EventKind::HealthCheck).unwrap();
    assert_eq!(envelope.header().version, "1.1.0");
}

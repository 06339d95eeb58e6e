use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Which producer observed an event.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Network,
    Dom,
    #[default]
    Synthetic,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Network => "network",
            EventSource::Dom => "dom",
            EventSource::Synthetic => "synthetic",
        }
    }
}

/// The normalized unit flowing through the pipeline. Once it is part of a
/// committed batch it is never mutated, only evicted.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub kind: String,
    #[serde(alias = "occurred_at", with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub source: EventSource,
    pub payload: Value,
}

impl EventRecord {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        occurred_at: OffsetDateTime,
        source: EventSource,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            occurred_at,
            source,
            payload,
        }
    }
}

/// Fallback identity for producers that don't supply one: a UUIDv7 is a
/// millisecond timestamp followed by random bits.
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// An event as submitted by a producer adapter, before defaults are applied.
#[derive(Default, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: Option<String>,
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(
        default,
        alias = "occurred_at",
        alias = "timestamp",
        with = "time::serde::rfc3339::option"
    )]
    pub occurred_at: Option<OffsetDateTime>,
    pub source: Option<EventSource>,
    #[serde(default, alias = "data")]
    pub payload: Value,
}

impl RawEvent {
    pub fn into_record(self, now: OffsetDateTime, default_source: EventSource) -> EventRecord {
        EventRecord {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_id),
            kind: self.kind,
            occurred_at: self.occurred_at.unwrap_or(now),
            source: self.source.unwrap_or(default_source),
            payload: self.payload,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawRequest {
    /// Batch of events
    Batch(Vec<RawEvent>),
    /// Single event
    One(Box<RawEvent>),
}

impl RawRequest {
    pub fn events(self) -> Vec<RawEvent> {
        match self {
            RawRequest::Batch(events) => events,
            RawRequest::One(event) => vec![*event],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn raw_event_defaults_missing_fields() {
        let now = datetime!(2024-05-01 10:00 UTC);
        let raw: RawEvent = serde_json::from_value(json!({"type": "presence"})).unwrap();
        let record = raw.into_record(now, EventSource::Dom);

        assert_eq!(record.kind, "presence");
        assert_eq!(record.occurred_at, now);
        assert_eq!(record.source, EventSource::Dom);
        assert_eq!(record.payload, Value::Null);
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn raw_event_keeps_producer_values() {
        let raw: RawEvent = serde_json::from_value(json!({
            "id": "msg-1",
            "kind": "message",
            "occurred_at": "2024-05-01T09:59:00Z",
            "source": "network",
            "payload": {"body": "hi"}
        }))
        .unwrap();
        let record = raw.into_record(datetime!(2024-05-01 10:00 UTC), EventSource::Synthetic);

        assert_eq!(record.id, "msg-1");
        assert_eq!(record.occurred_at, datetime!(2024-05-01 09:59 UTC));
        assert_eq!(record.source, EventSource::Network);
        assert_eq!(record.payload, json!({"body": "hi"}));
    }

    #[test]
    fn records_use_camel_case_on_the_wire() {
        let record = EventRecord::new(
            "msg-2",
            "message",
            datetime!(2024-05-01 09:59 UTC),
            EventSource::Dom,
            json!(null),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["occurredAt"], json!("2024-05-01T09:59:00Z"));
        assert!(value.get("occurred_at").is_none());

        let raw: RawEvent =
            serde_json::from_value(json!({"kind": "message", "occurredAt": "2024-05-01T09:59:00Z"}))
                .unwrap();
        assert_eq!(raw.occurred_at, Some(datetime!(2024-05-01 09:59 UTC)));
    }

    #[test]
    fn empty_id_gets_replaced() {
        let raw = RawEvent {
            id: Some(String::new()),
            kind: "contact".to_string(),
            ..Default::default()
        };
        let record = raw.into_record(OffsetDateTime::now_utc(), EventSource::Synthetic);
        assert!(!record.id.is_empty());
    }

    #[test]
    fn request_accepts_one_or_many() {
        let one: RawRequest = serde_json::from_value(json!({"kind": "a"})).unwrap();
        assert_eq!(one.events().len(), 1);

        let many: RawRequest =
            serde_json::from_value(json!([{"kind": "a"}, {"kind": "b", "id": "x"}])).unwrap();
        let events = many.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].id.as_deref(), Some("x"));
    }
}

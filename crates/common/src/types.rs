// Canonical event type routed by the gateway.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Source recorded on client-published events that do not name one.
pub const DEFAULT_EVENT_SOURCE: &str = "gateway";

/// A domain event as it travels through the event bus and out to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub source: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl GatewayEvent {
    pub fn new(event_type: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            source: source.into(),
            metadata: Map::new(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::GatewayEvent;

    #[test]
    fn event_serializes_type_and_omits_empty_metadata() {
        let event = GatewayEvent::new("price.updated", json!({ "sku": "A1" }), "svc-a");
        let value = serde_json::to_value(&event).expect("event should serialize");

        assert_eq!(value["type"], "price.updated");
        assert_eq!(value["source"], "svc-a");
        assert!(value.get("metadata").is_none());
        assert!(value.get("eventType").is_none());
    }

    #[test]
    fn metadata_entries_are_preserved() {
        let event = GatewayEvent::new("deal.found", json!(null), "svc-b")
            .with_metadata_entry("tier", json!("gold"));
        let value = serde_json::to_value(&event).expect("event should serialize");

        assert_eq!(value["metadata"]["tier"], "gold");
    }
}

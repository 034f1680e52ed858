// WebSocket message types for the beacon-events.v1 protocol.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::GatewayEvent;

pub const CURRENT_PROTOCOL_VERSION: &str = "beacon-events.v1";

/// Protocol versions accepted at connect time, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

/// Discriminant carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client -> Server: register a subscription.
    Subscribe,
    /// Client -> Server: drop a subscription.
    Unsubscribe,
    /// Client -> Server: publish an event onto the bus.
    Publish,
    /// Bidirectional liveness probe.
    Ping,
    /// Bidirectional liveness reply.
    Pong,
    /// Server -> Client: batched events. Client -> Server: batch control.
    Batch,
    /// Server -> Client: handshake after admission.
    Connected,
    /// Server -> Client: a single routed event.
    Event,
    /// Server -> Client: request outcome, correlated to the request.
    Ack,
    /// Server -> Client: error.
    Error,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Batch => "batch",
            Self::Connected => "connected",
            Self::Event => "event",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }
}

/// The frame envelope shared by all message types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("`{0}` message requires a payload")]
    Missing(&'static str),
    #[error("invalid `{kind}` payload: {source}")]
    Invalid {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload: Some(serde_json::to_value(payload)?),
            timestamp: now_millis(),
            correlation_id: None,
        })
    }

    pub fn empty(kind: MessageType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload: None,
            timestamp: now_millis(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Correlation id a reply to this message should carry.
    pub fn reply_correlation_id(&self) -> String {
        self.correlation_id.clone().unwrap_or_else(|| self.id.clone())
    }

    /// Decode the payload as `T`; a missing payload is an error.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let kind = self.kind.as_str();
        let payload = self.payload.clone().ok_or(PayloadError::Missing(kind))?;
        serde_json::from_value(payload).map_err(|source| PayloadError::Invalid { kind, source })
    }

    /// Decode the payload as `T`, treating a missing payload as `T::default()`.
    pub fn payload_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, PayloadError> {
        match self.payload {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.payload_as(),
        }
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    /// Exact match against `GatewayEvent::source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Every entry must be present with an equal value in the event metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    #[serde(default)]
    pub batching: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub id: String,
    pub event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<SubscriptionFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SubscriptionOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Flush,
}

/// Client -> Server payload of a `batch` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchControlPayload {
    pub action: BatchAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// Server -> Client payload of a `batch` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub subscription_id: String,
    pub events: Vec<GatewayEvent>,
    pub batch_size: usize,
    /// Flush time, unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub subscription_id: String,
    pub event: GatewayEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub protocol_version: String,
    pub server_time: i64,
    pub heartbeat_interval_ms: u64,
    pub max_message_size: usize,
    pub compression: bool,
    pub compression_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_uses_camel_case_and_type_key() {
        let envelope = Envelope::new(
            MessageType::Unsubscribe,
            &UnsubscribePayload { subscription_id: "s1".to_string() },
        )
        .expect("envelope should build")
        .with_correlation_id(Some("c-1".to_string()));

        let value = serde_json::to_value(&envelope).expect("envelope should serialize");
        assert_eq!(value["type"], "unsubscribe");
        assert_eq!(value["correlationId"], "c-1");
        assert_eq!(value["payload"]["subscriptionId"], "s1");
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let raw = r#"{"id":"1","type":"teleport","timestamp":0}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn missing_payload_is_reported_by_kind() {
        let envelope = Envelope::empty(MessageType::Subscribe);
        let error = envelope.payload_as::<SubscribePayload>().unwrap_err();
        assert_eq!(error.to_string(), "`subscribe` message requires a payload");
    }

    #[test]
    fn subscribe_payload_defaults_optional_sections() {
        let raw = json!({
            "id": "1",
            "type": "subscribe",
            "timestamp": 1,
            "payload": { "id": "sub-1", "eventTypes": ["price.updated"] }
        });
        let envelope: Envelope = serde_json::from_value(raw).expect("envelope should parse");
        let payload: SubscribePayload = envelope.payload_as().expect("payload should parse");

        assert_eq!(payload.event_types, vec!["price.updated".to_string()]);
        assert!(payload.filters.is_none());
        assert!(payload.options.is_none());
    }

    #[test]
    fn options_default_to_unbatched_normal_priority() {
        let options: SubscriptionOptions =
            serde_json::from_value(json!({})).expect("options should parse");
        assert!(!options.batching);
        assert_eq!(options.priority, Priority::Normal);
    }

    #[test]
    fn ping_without_payload_defaults() {
        let envelope = Envelope::empty(MessageType::Ping);
        let payload: PingPayload = envelope.payload_or_default().expect("default payload");
        assert_eq!(payload, PingPayload::default());
    }

    #[test]
    fn reply_correlation_falls_back_to_message_id() {
        let envelope = Envelope::empty(MessageType::Publish);
        assert_eq!(envelope.reply_correlation_id(), envelope.id);
    }
}

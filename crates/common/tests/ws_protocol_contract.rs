use beacon_common::protocol::close_code;
use beacon_common::protocol::ws::{
    AckPayload, BatchPayload, ConnectedPayload, Envelope, ErrorPayload, EventPayload, MessageType,
    PublishPayload, SubscribePayload, SubscriptionFilter, SubscriptionOptions,
    CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use beacon_common::types::GatewayEvent;
use serde_json::{json, Value};

#[test]
fn current_version_is_first_supported_version() {
    assert_eq!(SUPPORTED_PROTOCOL_VERSIONS[0], CURRENT_PROTOCOL_VERSION);
    assert_eq!(CURRENT_PROTOCOL_VERSION, "beacon-events.v1");
}

#[test]
fn close_codes_match_contract() {
    assert_eq!(close_code::NORMAL, 1000);
    assert_eq!(close_code::POLICY_VIOLATION, 1008);
    assert!(close_code::HEARTBEAT_TIMEOUT >= 4000, "custom codes live in the private range");
}

#[test]
fn envelope_shapes_match_contract() {
    let event = GatewayEvent::new("price.updated", json!({ "price": 10 }), "svc-a");
    let samples: Vec<(Envelope, &str, &[&str])> = vec![
        (
            Envelope::new(
                MessageType::Subscribe,
                &SubscribePayload {
                    id: "sub-1".to_string(),
                    event_types: vec!["price.updated".to_string()],
                    filters: Some(SubscriptionFilter {
                        source: Some("svc-a".to_string()),
                        metadata: None,
                    }),
                    options: Some(SubscriptionOptions::default()),
                },
            )
            .expect("subscribe should encode"),
            "subscribe",
            &["id", "eventTypes", "filters", "options"][..],
        ),
        (
            Envelope::new(
                MessageType::Publish,
                &PublishPayload {
                    event_type: "deal.found".to_string(),
                    payload: json!({}),
                    metadata: None,
                },
            )
            .expect("publish should encode"),
            "publish",
            &["type", "payload"][..],
        ),
        (
            Envelope::new(
                MessageType::Batch,
                &BatchPayload {
                    subscription_id: "sub-1".to_string(),
                    events: vec![event.clone()],
                    batch_size: 1,
                    timestamp: 5,
                },
            )
            .expect("batch should encode"),
            "batch",
            &["subscriptionId", "events", "batchSize", "timestamp"][..],
        ),
        (
            Envelope::new(
                MessageType::Event,
                &EventPayload { subscription_id: "sub-1".to_string(), event },
            )
            .expect("event should encode"),
            "event",
            &["subscriptionId", "event"][..],
        ),
        (
            Envelope::new(
                MessageType::Connected,
                &ConnectedPayload {
                    connection_id: "c1".to_string(),
                    user_id: None,
                    protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
                    server_time: 1,
                    heartbeat_interval_ms: 30_000,
                    max_message_size: 65_536,
                    compression: true,
                    compression_threshold: 1024,
                },
            )
            .expect("connected should encode"),
            "connected",
            &["connectionId", "protocolVersion", "compression", "compressionThreshold"][..],
        ),
        (
            Envelope::new(
                MessageType::Ack,
                &AckPayload { success: false, error: Some("down".to_string()), ..Default::default() },
            )
            .expect("ack should encode"),
            "ack",
            &["success", "error"][..],
        ),
        (
            Envelope::new(
                MessageType::Error,
                &ErrorPayload {
                    code: "RATE_LIMITED".to_string(),
                    message: "slow down".to_string(),
                    retryable: true,
                    retry_after: Some(3),
                },
            )
            .expect("error should encode"),
            "error",
            &["code", "message", "retryable", "retryAfter"][..],
        ),
    ];

    for (envelope, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(&envelope).expect("envelope should serialize");
        assert_eq!(value["type"], expected_type);
        for key in ["id", "type", "timestamp", "payload"] {
            assert!(value.get(key).is_some(), "`{expected_type}` envelope must include `{key}`");
        }
        for key in expected_keys {
            assert!(
                value["payload"].get(key).is_some(),
                "`{expected_type}` payload must include `{key}`",
            );
        }
    }
}

#[test]
fn optional_fields_are_omitted_when_absent() {
    let envelope = Envelope::empty(MessageType::Ping);
    let value = serde_json::to_value(&envelope).expect("ping should serialize");

    assert!(!object_keys(&value).contains(&"payload".to_string()));
    assert!(!object_keys(&value).contains(&"correlationId".to_string()));
}

fn object_keys(value: &Value) -> Vec<String> {
    let mut keys =
        value.as_object().expect("value should be an object").keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}

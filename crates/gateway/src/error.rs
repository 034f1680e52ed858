use std::{future::Future, net::IpAddr};

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use beacon_common::protocol::{
    close_code,
    ws::{Envelope, ErrorPayload, MessageType, PayloadError},
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::codec::CodecError;
use crate::subscription::SubscriptionError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidMessage,
    MessageTooLarge,
    UnsupportedMessage,
    RateLimited,
    SubscriptionLimit,
    SubscriptionNotFound,
    CapacityExceeded,
    AuthFailed,
    AddressBlocked,
    UpgradeRequired,
    UpstreamUnavailable,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::SubscriptionLimit => "SUBSCRIPTION_LIMIT",
            Self::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::AddressBlocked => "ADDRESS_BLOCKED",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::InvalidMessage | Self::UnsupportedMessage => StatusCode::BAD_REQUEST,
            Self::MessageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited | Self::AddressBlocked => StatusCode::TOO_MANY_REQUESTS,
            Self::SubscriptionLimit => StatusCode::CONFLICT,
            Self::SubscriptionNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::CapacityExceeded | Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::AddressBlocked
                | Self::CapacityExceeded
                | Self::UpstreamUnavailable
                | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::InvalidMessage => "message could not be parsed",
            Self::MessageTooLarge => "message exceeds maximum allowed size",
            Self::UnsupportedMessage => "message type is not accepted from clients",
            Self::RateLimited => "message was rate limited",
            Self::SubscriptionLimit => "subscription limit reached for this connection",
            Self::SubscriptionNotFound => "subscription not found",
            Self::CapacityExceeded => "gateway is at capacity",
            Self::AuthFailed => "authentication failed",
            Self::AddressBlocked => "address is temporarily blocked",
            Self::UpgradeRequired => "client protocol version is not supported",
            Self::UpstreamUnavailable => "event bus is unavailable",
            Self::NotFound => "requested resource not found",
            Self::InternalError => "internal server error",
        }
    }
}

/// Which limit rejected a message or connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    MessageRate,
    Burst,
    Blocked,
    ConnectionLimit,
}

impl LimitKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageRate => "message_rate",
            Self::Burst => "burst",
            Self::Blocked => "blocked",
            Self::ConnectionLimit => "connection_limit",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} limit exceeded, retry after {retry_after_secs}s")]
pub struct RateLimitError {
    pub kind: LimitKind,
    /// Whole seconds, never zero.
    pub retry_after_secs: u64,
}

impl RateLimitError {
    pub fn code(&self) -> ErrorCode {
        match self.kind {
            LimitKind::Blocked => ErrorCode::AddressBlocked,
            _ => ErrorCode::RateLimited,
        }
    }
}

/// Connection-level refusal. The socket is closed with [`AdmissionError::close_code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("gateway is at capacity ({max} connections)")]
    CapacityExceeded { max: usize },
    #[error("address {address} reached its connection limit")]
    AddressLimit { address: IpAddr, retry_after_secs: u64 },
    #[error("address {address} is blocked for {retry_after_secs}s")]
    Blocked { address: IpAddr, retry_after_secs: u64 },
    #[error("authentication token missing")]
    MissingToken,
    #[error("authentication token rejected")]
    AuthRejected,
    #[error("unsupported protocol version `{0}`")]
    UnsupportedProtocol(String),
    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    pub fn from_rate_limit(address: IpAddr, error: RateLimitError) -> Self {
        match error.kind {
            LimitKind::Blocked => {
                Self::Blocked { address, retry_after_secs: error.retry_after_secs }
            }
            _ => Self::AddressLimit { address, retry_after_secs: error.retry_after_secs },
        }
    }

    pub const fn close_code(&self) -> u16 {
        match self {
            Self::ShuttingDown => close_code::NORMAL,
            _ => close_code::POLICY_VIOLATION,
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::AddressLimit { .. } => ErrorCode::RateLimited,
            Self::Blocked { .. } => ErrorCode::AddressBlocked,
            Self::MissingToken | Self::AuthRejected => ErrorCode::AuthFailed,
            Self::UnsupportedProtocol(_) => ErrorCode::UpgradeRequired,
            Self::ShuttingDown => ErrorCode::CapacityExceeded,
        }
    }

    /// Label used for the rejection counter.
    pub const fn metric_label(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity",
            Self::AddressLimit { .. } => "address_limit",
            Self::Blocked { .. } => "blocked",
            Self::MissingToken | Self::AuthRejected => "auth",
            Self::UnsupportedProtocol(_) => "protocol",
            Self::ShuttingDown => "shutdown",
        }
    }
}

/// A malformed or unacceptable client frame. Reported with an `error` frame;
/// the connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("invalid subscription: {0}")]
    InvalidSubscription(&'static str),
    #[error("invalid publish: {0}")]
    InvalidPublish(&'static str),
    #[error("`{0}` messages are not accepted from clients")]
    Unsupported(&'static str),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("compressed frame could not be decoded: {0}")]
    Decompress(#[source] CodecError),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TooLarge { .. } | Self::Decompress(CodecError::TooLarge { .. }) => {
                ErrorCode::MessageTooLarge
            }
            Self::Malformed(_)
            | Self::Payload(_)
            | Self::InvalidSubscription(_)
            | Self::InvalidPublish(_)
            | Self::Decompress(_) => ErrorCode::InvalidMessage,
            Self::Unsupported(_) => ErrorCode::UnsupportedMessage,
            Self::Subscription(SubscriptionError::LimitExceeded { .. }) => {
                ErrorCode::SubscriptionLimit
            }
            Self::Subscription(SubscriptionError::NotFound { .. }) => {
                ErrorCode::SubscriptionNotFound
            }
            Self::Subscription(SubscriptionError::UnknownConnection { .. }) => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Failure to hand a frame to a connection's socket task.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection {0} is no longer registered")]
    UnknownConnection(String),
    #[error("connection {0} outbound channel is closed")]
    ChannelClosed(String),
    #[error(transparent)]
    Encode(#[from] CodecError),
}

/// Failure of the external event bus, as seen through the circuit breaker.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("circuit `{name}` is open")]
    CircuitOpen { name: String },
    #[error("event bus call failed: {0}")]
    Bus(String),
}

/// Build the `error` frame sent to a client.
pub fn error_envelope(
    code: ErrorCode,
    message: impl Into<String>,
    retry_after: Option<u64>,
    correlation_id: Option<String>,
) -> Envelope {
    let payload = ErrorPayload {
        code: code.as_str().to_owned(),
        message: message.into(),
        retryable: code.retryable(),
        retry_after,
    };
    match Envelope::new(MessageType::Error, &payload) {
        Ok(envelope) => envelope.with_correlation_id(correlation_id),
        // ErrorPayload always serializes; keep a payload-less frame as the fallback.
        Err(_) => Envelope::empty(MessageType::Error).with_correlation_id(correlation_id),
    }
}

/// JSON error body for the HTTP surface.
#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use beacon_common::protocol::ws::ErrorPayload;
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn api_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()),
            Some("req-scoped-123")
        );
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        let parsed: Value =
            serde_json::from_slice(&body).expect("error response body should be valid json");

        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
    }

    #[test]
    fn admission_errors_close_with_policy_violation() {
        let address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let rejected = [
            AdmissionError::CapacityExceeded { max: 2 },
            AdmissionError::AddressLimit { address, retry_after_secs: 1 },
            AdmissionError::Blocked { address, retry_after_secs: 30 },
            AdmissionError::AuthRejected,
            AdmissionError::UnsupportedProtocol("v0".into()),
        ];
        for error in rejected {
            assert_eq!(error.close_code(), 1008, "{error}");
        }
        assert_eq!(AdmissionError::ShuttingDown.close_code(), 1000);
    }

    #[test]
    fn blocked_rate_limit_maps_to_blocked_admission() {
        let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let error = AdmissionError::from_rate_limit(
            address,
            RateLimitError { kind: LimitKind::Blocked, retry_after_secs: 12 },
        );
        assert_eq!(error, AdmissionError::Blocked { address, retry_after_secs: 12 });
        assert_eq!(error.code(), ErrorCode::AddressBlocked);
    }

    #[test]
    fn subscription_errors_keep_distinct_codes() {
        let limit = ProtocolError::from(SubscriptionError::LimitExceeded { max: 3 });
        let missing =
            ProtocolError::from(SubscriptionError::NotFound { subscription_id: "s".into() });
        assert_eq!(limit.code(), ErrorCode::SubscriptionLimit);
        assert_eq!(missing.code(), ErrorCode::SubscriptionNotFound);
    }

    #[test]
    fn error_envelope_carries_retry_hint_and_correlation() {
        let envelope =
            error_envelope(ErrorCode::RateLimited, "slow down", Some(4), Some("req-1".into()));
        assert_eq!(envelope.correlation_id.as_deref(), Some("req-1"));

        let payload: ErrorPayload = envelope.payload_as().expect("error payload should decode");
        assert_eq!(payload.code, "RATE_LIMITED");
        assert!(payload.retryable);
        assert_eq!(payload.retry_after, Some(4));
    }
}

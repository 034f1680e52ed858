use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::token_from_header;
use crate::codec::EncodedFrame;
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::gateway::{ConnectRequest, Gateway};
use crate::registry::{CloseReason, Outbound};

/// The transport accepts frames up to this multiple of the configured
/// message limit, so an oversized message gets a `MESSAGE_TOO_LARGE` error
/// frame instead of a dropped socket.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub token: Option<String>,
    /// Id of an earlier connection to resume.
    pub connection_id: Option<String>,
    pub protocol: Option<String>,
}

pub async fn ws_upgrade(
    State(gateway): State<Gateway>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token_header = gateway.config().auth.token_header.as_str();
    let token = headers
        .get(token_header)
        .and_then(|value| value.to_str().ok())
        .and_then(token_from_header)
        .map(ToOwned::to_owned)
        .or_else(|| params.token.filter(|token| !token.trim().is_empty()));

    let request = ConnectRequest {
        address: peer.ip(),
        token,
        requested_id: params.connection_id,
        protocol: params.protocol,
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let transport_limit =
        gateway.config().limits.max_message_size_bytes.saturating_mul(TRANSPORT_LIMIT_FACTOR);

    // Admission runs after the upgrade so a refusal can carry a close code.
    ws.max_message_size(transport_limit).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(gateway, socket, request)).await;
    })
}

async fn handle_socket(gateway: Gateway, mut socket: WebSocket, request: ConnectRequest) {
    let _guard = gateway.socket_opened();
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel();
    let connection_id = match gateway.admit(request, outbound_sender.clone()).await {
        Ok(admitted) => admitted.connection_id,
        Err(error) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: error.close_code(),
                    reason: error.to_string().into(),
                })))
                .await;
            return;
        }
    };
    debug!(connection_id = %connection_id, request_id = %request_id, "socket open");

    let reason = loop {
        tokio::select! {
            // Drain queued frames (and a pending close) before reading more.
            biased;

            outbound = outbound_receiver.recv() => {
                let Some(outbound) = outbound else {
                    break CloseReason::DeliveryFailed;
                };
                let message = match outbound {
                    Outbound::Frame(EncodedFrame::Text(text)) => Message::Text(text.into()),
                    Outbound::Frame(EncodedFrame::Binary(bytes)) => Message::Binary(bytes.into()),
                    Outbound::Ping => Message::Ping(Vec::new().into()),
                    Outbound::Close { code, reason } => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        // The registry already removed this connection.
                        return;
                    }
                };
                if socket.send(message).await.is_err() {
                    break CloseReason::SocketError;
                }
            }
            inbound = socket.recv() => {
                let Some(inbound) = inbound else {
                    break CloseReason::ClientClosed;
                };

                match inbound {
                    Ok(Message::Text(text)) => gateway.handle_text(&connection_id, text.as_str()).await,
                    Ok(Message::Binary(bytes)) => gateway.handle_binary(&connection_id, &bytes).await,
                    Ok(Message::Ping(payload)) => {
                        gateway.touch(&connection_id).await;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break CloseReason::SocketError;
                        }
                    }
                    Ok(Message::Pong(_)) => gateway.handle_pong(&connection_id).await,
                    Ok(Message::Close(_)) => break CloseReason::ClientClosed,
                    Err(error) => {
                        warn!(connection_id = %connection_id, error = %error, "socket error");
                        break CloseReason::SocketError;
                    }
                }
            }
        }
    };

    gateway.release(&connection_id, &outbound_sender, reason).await;
}

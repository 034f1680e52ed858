// Read-only operational endpoints.

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::error::{ApiError, ErrorCode};
use crate::gateway::{Gateway, GatewayStats};
use crate::registry::ConnectionInfo;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/v1/stats", get(stats))
        .route("/v1/connections/{connection_id}", get(connection))
        .with_state(gateway)
}

async fn metrics(State(gateway): State<Gateway>) -> Response {
    let body = gateway.metrics_snapshot().await.render_prometheus();
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response()
}

async fn stats(State(gateway): State<Gateway>) -> Json<GatewayStats> {
    Json(gateway.stats().await)
}

async fn connection(
    State(gateway): State<Gateway>,
    Path(connection_id): Path<String>,
) -> Result<Json<ConnectionInfo>, ApiError> {
    gateway.connection_info(&connection_id).await.map(Json).ok_or_else(|| {
        ApiError::new(ErrorCode::NotFound, format!("connection `{connection_id}` not found"))
    })
}

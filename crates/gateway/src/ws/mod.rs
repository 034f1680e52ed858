// WebSocket transport: the upgrade route and the per-socket task.

mod handler;

use axum::{routing::get, Router};

use crate::gateway::Gateway;

pub use handler::{ws_upgrade, ConnectParams};

pub fn router(gateway: Gateway) -> Router {
    let path = gateway.config().ws_path.clone();
    Router::new().route(&path, get(ws_upgrade)).with_state(gateway)
}

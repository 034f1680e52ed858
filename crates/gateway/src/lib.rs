//! Real-time event gateway: WebSocket clients subscribe to typed domain
//! events, the gateway fans events from the event bus out to them.

pub mod api;
pub mod auth;
pub mod batch;
pub mod bus;
pub mod codec;
pub mod config;
pub mod cors;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod subscription;
pub mod ws;

pub use gateway::{Admitted, ConnectRequest, Gateway, GatewayStats};

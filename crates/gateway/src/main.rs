use std::{net::SocketAddr, sync::Arc};

use anyhow::{bail, Context};
use beacon_gateway::{
    auth::{AuthValidator, JwtAuthValidator},
    bus::InMemoryEventBus,
    config::GatewayConfig,
    metrics::GatewayMetrics,
    server::build_router,
    Gateway,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    init_tracing(&config);
    config.validate().context("invalid gateway configuration")?;

    let auth = build_auth(&config)?;
    let bus = Arc::new(InMemoryEventBus::new());
    let metrics = Arc::new(GatewayMetrics::default());
    let gateway =
        Gateway::new(config.clone(), bus, auth, metrics).context("failed to build gateway")?;
    gateway.start();

    let listen_addr = config.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {listen_addr}"))?;

    info!(
        listen_addr = %listen_addr,
        ws_path = %config.ws_path,
        auth_enabled = config.auth.enabled,
        max_connections = config.limits.max_connections,
        "starting event gateway"
    );

    let app = build_router(gateway.clone());
    let grace = config.shutdown_grace;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            gateway.shutdown(grace).await;
        })
        .await
        .context("gateway server exited unexpectedly")
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_auth(config: &GatewayConfig) -> anyhow::Result<Option<Arc<dyn AuthValidator>>> {
    match config.auth.jwt_secret.as_deref() {
        Some(secret) => {
            let validator: Arc<dyn AuthValidator> = Arc::new(
                JwtAuthValidator::new(secret).context("invalid BEACON_GATEWAY_JWT_SECRET")?,
            );
            Ok(Some(validator))
        }
        None if config.auth.enabled => {
            bail!("BEACON_GATEWAY_AUTH_ENABLED is set but BEACON_GATEWAY_JWT_SECRET is missing")
        }
        None => Ok(None),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use beacon_gateway::config::GatewayConfig;

    use super::build_auth;

    #[test]
    fn auth_is_optional_without_a_secret() {
        let config = GatewayConfig::default();
        assert!(build_auth(&config).expect("no secret, auth disabled").is_none());
    }

    #[test]
    fn enabled_auth_requires_a_secret() {
        let mut config = GatewayConfig::default();
        config.auth.enabled = true;
        assert!(build_auth(&config).is_err());

        config.auth.jwt_secret = Some("short".into());
        assert!(build_auth(&config).is_err());

        config.auth.jwt_secret = Some("beacon_test_secret_that_is_definitely_long_enough".into());
        assert!(build_auth(&config).expect("valid secret").is_some());
    }
}

// Gateway configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Component sections (rate limiting, batching, heartbeat,
// circuit breaker) are defined next to the code that consumes them and
// composed here. `validate` rejects unusable combinations at startup.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::batch::BatchConfig;
use crate::bus::breaker::CircuitBreakerConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::rate_limit::RateLimitConfig;

const ENV_PREFIX: &str = "BEACON_GATEWAY_";

/// Authentication settings for the admission path.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When true, connections without an accepted token are rejected.
    pub enabled: bool,
    /// Header carrying the token (`Bearer ` prefix is optional).
    pub token_header: String,
    /// HS256 secret for the bundled JWT validator.
    pub jwt_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { enabled: false, token_header: "authorization".into(), jwt_secret: None }
    }
}

/// Capacity ceilings enforced at admission and per message.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_subscriptions_per_connection: usize,
    pub max_message_size_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_subscriptions_per_connection: 50,
            max_message_size_bytes: 64 * 1024,
        }
    }
}

/// Core gateway configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Path serving the WebSocket upgrade.
    pub ws_path: String,
    /// Log filter directive (e.g. `info`, `beacon_gateway=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub heartbeat: HeartbeatConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Period of the metrics log emitter.
    pub metrics_interval: Duration,
    /// Period of the rate-limiter cleanup sweep.
    pub cleanup_interval: Duration,
    /// How long shutdown waits for socket tasks to finish.
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_path: "/ws".into(),
            log_filter: "info".into(),
            log_json: false,
            cors_origins: None,
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            metrics_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("`{field}` must be within {range}, got {value}")]
    OutOfRange { field: &'static str, range: &'static str, value: f64 },
    #[error("ws path `{0}` must start with `/`")]
    InvalidWsPath(String),
    #[error("heartbeat timeout ({timeout_ms}ms) must be at least the interval ({interval_ms}ms)")]
    HeartbeatTimeoutTooShort { interval_ms: u128, timeout_ms: u128 },
    #[error("default batch size {default} exceeds max batch size {max}")]
    BatchSizeAboveMax { default: usize, max: usize },
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable (prefix `BEACON_GATEWAY_`) | Default |
    /// |---|---|
    /// | `HOST` / `PORT` | `0.0.0.0` / `8080` |
    /// | `WS_PATH` | `/ws` |
    /// | `LOG_FILTER` / `LOG_JSON` | `info` / `false` |
    /// | `CORS_ORIGINS` | *(none, dev defaults)* |
    /// | `AUTH_ENABLED` / `AUTH_TOKEN_HEADER` / `JWT_SECRET` | `false` / `authorization` / *(none)* |
    /// | `MAX_CONNECTIONS` / `MAX_CONNECTIONS_PER_ADDRESS` | `10000` / `10` |
    /// | `MAX_SUBSCRIPTIONS` / `MAX_MESSAGE_BYTES` | `50` / `65536` |
    /// | `RATE_LIMIT_ENABLED` / `RATE_LIMIT_MESSAGES` / `RATE_LIMIT_WINDOW_MS` | `true` / `120` / `60000` |
    /// | `BURST_FRACTION` / `BURST_WINDOW_MS` | `0.5` / `10000` |
    /// | `ABUSE_WINDOW_MS` / `ABUSE_MIN_REJECTIONS` / `ABUSE_REJECTION_RATIO` | `60000` / `20` / `0.5` |
    /// | `BLOCK_DURATION_MS` / `BUCKET_RETENTION_MS` | `300000` / `600000` |
    /// | `BATCH_SIZE` / `BATCH_TIMEOUT_MS` / `MAX_BATCH_SIZE` | `10` / `1000` / `100` |
    /// | `COMPRESSION_ENABLED` / `COMPRESSION_THRESHOLD_BYTES` | `true` / `1024` |
    /// | `HEARTBEAT_INTERVAL_MS` / `HEARTBEAT_TIMEOUT_MS` | `30000` / twice the interval |
    /// | `METRICS_INTERVAL_MS` / `CLEANUP_INTERVAL_MS` | `60000` / `60000` |
    /// | `SHUTDOWN_GRACE_MS` | `10000` |
    /// | `BREAKER_FAILURE_THRESHOLD` / `BREAKER_RESET_MS` | `5` / `30000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let lookup = |name: &str| env(&format!("{ENV_PREFIX}{name}")).ok();
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&lookup, "PORT", defaults.listen_addr.port());
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let auth = AuthConfig {
            enabled: parse_bool_or(&lookup, "AUTH_ENABLED", defaults.auth.enabled),
            token_header: lookup("AUTH_TOKEN_HEADER")
                .map(|header| header.trim().to_ascii_lowercase())
                .filter(|header| !header.is_empty())
                .unwrap_or(defaults.auth.token_header),
            jwt_secret: lookup("JWT_SECRET"),
        };

        let limits = LimitsConfig {
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", defaults.limits.max_connections),
            max_subscriptions_per_connection: parse_or(
                &lookup,
                "MAX_SUBSCRIPTIONS",
                defaults.limits.max_subscriptions_per_connection,
            ),
            max_message_size_bytes: parse_or(
                &lookup,
                "MAX_MESSAGE_BYTES",
                defaults.limits.max_message_size_bytes,
            ),
        };

        let rl = defaults.rate_limit;
        let rate_limit = RateLimitConfig {
            enabled: parse_bool_or(&lookup, "RATE_LIMIT_ENABLED", rl.enabled),
            messages_per_window: parse_or(&lookup, "RATE_LIMIT_MESSAGES", rl.messages_per_window),
            window: parse_millis_or(&lookup, "RATE_LIMIT_WINDOW_MS", rl.window),
            burst_fraction: parse_or(&lookup, "BURST_FRACTION", rl.burst_fraction),
            burst_window: parse_millis_or(&lookup, "BURST_WINDOW_MS", rl.burst_window),
            abuse_window: parse_millis_or(&lookup, "ABUSE_WINDOW_MS", rl.abuse_window),
            abuse_min_rejections: parse_or(&lookup, "ABUSE_MIN_REJECTIONS", rl.abuse_min_rejections),
            abuse_rejection_ratio: parse_or(
                &lookup,
                "ABUSE_REJECTION_RATIO",
                rl.abuse_rejection_ratio,
            ),
            block_duration: parse_millis_or(&lookup, "BLOCK_DURATION_MS", rl.block_duration),
            bucket_retention: parse_millis_or(&lookup, "BUCKET_RETENTION_MS", rl.bucket_retention),
            max_connections_per_address: parse_or(
                &lookup,
                "MAX_CONNECTIONS_PER_ADDRESS",
                rl.max_connections_per_address,
            ),
        };

        let b = defaults.batch;
        let batch = BatchConfig {
            default_batch_size: parse_or(&lookup, "BATCH_SIZE", b.default_batch_size),
            default_timeout: parse_millis_or(&lookup, "BATCH_TIMEOUT_MS", b.default_timeout),
            max_batch_size: parse_or(&lookup, "MAX_BATCH_SIZE", b.max_batch_size),
            compression_enabled: parse_bool_or(&lookup, "COMPRESSION_ENABLED", b.compression_enabled),
            compression_threshold_bytes: parse_or(
                &lookup,
                "COMPRESSION_THRESHOLD_BYTES",
                b.compression_threshold_bytes,
            ),
        };

        let heartbeat_interval =
            parse_millis_or(&lookup, "HEARTBEAT_INTERVAL_MS", defaults.heartbeat.interval);
        let heartbeat = HeartbeatConfig {
            interval: heartbeat_interval,
            timeout: parse_millis_or(&lookup, "HEARTBEAT_TIMEOUT_MS", heartbeat_interval * 2),
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parse_or(
                &lookup,
                "BREAKER_FAILURE_THRESHOLD",
                defaults.circuit_breaker.failure_threshold,
            ),
            reset_timeout: parse_millis_or(
                &lookup,
                "BREAKER_RESET_MS",
                defaults.circuit_breaker.reset_timeout,
            ),
        };

        Self {
            listen_addr,
            ws_path: lookup("WS_PATH").unwrap_or(defaults.ws_path),
            log_filter: lookup("LOG_FILTER").unwrap_or(defaults.log_filter),
            log_json: parse_bool_or(&lookup, "LOG_JSON", defaults.log_json),
            cors_origins: lookup("CORS_ORIGINS"),
            auth,
            limits,
            rate_limit,
            batch,
            heartbeat,
            circuit_breaker,
            metrics_interval: parse_millis_or(
                &lookup,
                "METRICS_INTERVAL_MS",
                defaults.metrics_interval,
            ),
            cleanup_interval: parse_millis_or(
                &lookup,
                "CLEANUP_INTERVAL_MS",
                defaults.cleanup_interval,
            ),
            shutdown_grace: parse_millis_or(
                &lookup,
                "SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace,
            ),
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidWsPath(self.ws_path.clone()));
        }

        require_nonzero("max_connections", self.limits.max_connections as u128)?;
        require_nonzero(
            "max_subscriptions_per_connection",
            self.limits.max_subscriptions_per_connection as u128,
        )?;
        require_nonzero("max_message_size_bytes", self.limits.max_message_size_bytes as u128)?;

        let rl = &self.rate_limit;
        require_nonzero("messages_per_window", rl.messages_per_window as u128)?;
        require_nonzero("window", rl.window.as_millis())?;
        require_nonzero("burst_window", rl.burst_window.as_millis())?;
        require_nonzero("abuse_window", rl.abuse_window.as_millis())?;
        require_nonzero("block_duration", rl.block_duration.as_millis())?;
        require_nonzero("max_connections_per_address", rl.max_connections_per_address as u128)?;
        require_range("burst_fraction", rl.burst_fraction, "(0, 1]", |v| v > 0.0 && v <= 1.0)?;
        require_range("abuse_rejection_ratio", rl.abuse_rejection_ratio, "[0, 1)", |v| {
            (0.0..1.0).contains(&v)
        })?;

        let b = &self.batch;
        require_nonzero("default_batch_size", b.default_batch_size as u128)?;
        require_nonzero("max_batch_size", b.max_batch_size as u128)?;
        require_nonzero("default_timeout", b.default_timeout.as_millis())?;
        if b.default_batch_size > b.max_batch_size {
            return Err(ConfigError::BatchSizeAboveMax {
                default: b.default_batch_size,
                max: b.max_batch_size,
            });
        }

        require_nonzero("heartbeat_interval", self.heartbeat.interval.as_millis())?;
        if self.heartbeat.timeout < self.heartbeat.interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort {
                interval_ms: self.heartbeat.interval.as_millis(),
                timeout_ms: self.heartbeat.timeout.as_millis(),
            });
        }

        require_nonzero("failure_threshold", self.circuit_breaker.failure_threshold as u128)?;
        require_nonzero("metrics_interval", self.metrics_interval.as_millis())?;
        require_nonzero("cleanup_interval", self.cleanup_interval.as_millis())?;

        Ok(())
    }
}

fn parse_or<T, L>(lookup: &L, name: &str, default: T) -> T
where
    T: FromStr,
    L: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

fn parse_millis_or<L>(lookup: &L, name: &str, default: Duration) -> Duration
where
    L: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_bool_or<L>(lookup: &L, name: &str, default: bool) -> bool
where
    L: Fn(&str) -> Option<String>,
{
    match lookup(name).map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn require_nonzero(field: &'static str, value: u128) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

fn require_range(
    field: &'static str,
    value: f64,
    range: &'static str,
    accept: impl Fn(f64) -> bool,
) -> Result<(), ConfigError> {
    if accept(value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, range, value })
    }
}

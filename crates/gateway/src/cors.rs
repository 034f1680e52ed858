// CORS configuration for the HTTP endpoints.
//
// Origins come from `GatewayConfig::cors_origins` (comma-separated). Without
// it, permissive localhost defaults are used for development.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

/// Default origins allowed when no origin list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] from the configured origin list.
///
/// - `"*"` allows any origin, without credentials.
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the default development origins.
///
/// Preflight responses are cached for an hour and `X-Request-Id` is exposed.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::IntoResponse, routing::get, Router};
    use tower::ServiceExt;

    async fn ok_handler() -> impl IntoResponse {
        "ok"
    }

    fn test_app(origins: Option<&str>) -> Router {
        Router::new().route("/v1/stats", get(ok_handler)).layer(cors_layer(origins))
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/stats")
            .header("origin", origin)
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn preflight_allows_default_dev_origin() {
        let response = test_app(None).oneshot(preflight("http://localhost:3000")).await.unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(response.headers().get("access-control-max-age").unwrap(), "3600");
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_origin() {
        let response =
            test_app(None).oneshot(preflight("https://evil.example.com")).await.unwrap();

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_defaults() {
        let app = test_app(Some("https://ops.example.com, https://staging.example.com"));
        let response = app.oneshot(preflight("https://ops.example.com")).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://ops.example.com"
        );

        let app = test_app(Some("https://ops.example.com"));
        let response = app.oneshot(preflight("http://localhost:3000")).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response =
            test_app(Some("*")).oneshot(preflight("https://anything.example.com")).await.unwrap();

        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins, vec!["https://a.com", "https://b.com"]);
    }
}

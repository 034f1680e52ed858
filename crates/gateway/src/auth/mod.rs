// Connection authentication.
//
// The gateway hands the raw token to an injected validator during admission,
// outside its state lock. Validators never see connection state.

pub mod jwt;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

pub use jwt::JwtAuthValidator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted { user_id: Option<String> },
    Rejected,
}

#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, token: &str) -> AuthDecision;
}

/// Fixed token -> user mapping, for development and service-to-service use.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Option<String>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: Option<&str>) -> Self {
        self.tokens.insert(token.into(), user_id.map(str::to_owned));
        self
    }
}

#[async_trait]
impl AuthValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> AuthDecision {
        match self.tokens.get(token) {
            Some(user_id) => AuthDecision::Accepted { user_id: user_id.clone() },
            None => AuthDecision::Rejected,
        }
    }
}

pub type BoxedDecision = Pin<Box<dyn Future<Output = AuthDecision> + Send>>;

/// Adapts an async closure into a validator.
pub struct FnValidator<F> {
    validate: F,
}

impl<F> FnValidator<F>
where
    F: Fn(String) -> BoxedDecision + Send + Sync,
{
    pub fn new(validate: F) -> Self {
        Self { validate }
    }
}

#[async_trait]
impl<F> AuthValidator for FnValidator<F>
where
    F: Fn(String) -> BoxedDecision + Send + Sync,
{
    async fn validate(&self, token: &str) -> AuthDecision {
        (self.validate)(token.to_owned()).await
    }
}

/// Pull a token from a header value, dropping an optional `Bearer ` prefix.
pub fn token_from_header(value: &str) -> Option<&str> {
    let value = value.trim();
    let token = match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tokens_map_to_users() {
        let validator = StaticTokenValidator::new()
            .with_token("svc-token", None)
            .with_token("alice-token", Some("alice"));

        assert_eq!(
            validator.validate("alice-token").await,
            AuthDecision::Accepted { user_id: Some("alice".into()) }
        );
        assert_eq!(validator.validate("svc-token").await, AuthDecision::Accepted { user_id: None });
        assert_eq!(validator.validate("nope").await, AuthDecision::Rejected);
    }

    #[tokio::test]
    async fn closure_validator_runs_async_logic() {
        let validator = FnValidator::new(|token: String| -> BoxedDecision {
            Box::pin(async move {
                if token.starts_with("ok:") {
                    AuthDecision::Accepted { user_id: Some(token[3..].to_owned()) }
                } else {
                    AuthDecision::Rejected
                }
            })
        });

        assert_eq!(
            validator.validate("ok:bob").await,
            AuthDecision::Accepted { user_id: Some("bob".into()) }
        );
        assert_eq!(validator.validate("bad").await, AuthDecision::Rejected);
    }

    #[test]
    fn bearer_prefix_is_optional_and_case_insensitive() {
        assert_eq!(token_from_header("Bearer abc"), Some("abc"));
        assert_eq!(token_from_header("bearer   abc "), Some("abc"));
        assert_eq!(token_from_header("abc"), Some("abc"));
        assert_eq!(token_from_header("Bearer "), None);
        assert_eq!(token_from_header(""), None);
    }
}

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{AuthDecision, AuthValidator};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GatewayClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// HS256 bearer tokens whose `sub` claim names the connecting user.
#[derive(Clone)]
pub struct JwtAuthValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthValidator {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a token for `user_id`. Used by operators and tests; the gateway
    /// itself only validates.
    pub fn issue_token(&self, user_id: &str) -> anyhow::Result<String> {
        self.issue_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: &str, issued_at: i64) -> anyhow::Result<String> {
        let claims = GatewayClaims {
            sub: user_id.to_owned(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Decode and verify a token, returning its subject.
    pub fn verify(&self, token: &str) -> anyhow::Result<String> {
        let claims = decode::<GatewayClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let subject = claims.sub.trim();
        if subject.is_empty() {
            bail!("access token subject is empty");
        }
        Ok(subject.to_owned())
    }
}

#[async_trait]
impl AuthValidator for JwtAuthValidator {
    async fn validate(&self, token: &str) -> AuthDecision {
        match self.verify(token) {
            Ok(user_id) => AuthDecision::Accepted { user_id: Some(user_id) },
            Err(error) => {
                debug!(error = %error, "jwt validation failed");
                AuthDecision::Rejected
            }
        }
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

//! Bearer-token authentication for the upgrade endpoint.
//!
//! `Authenticator` is the capability the upgrade handler depends on; the
//! concrete `JwtAuthenticator` validates an HS256-signed token and caches the
//! decoded identity so a reconnect storm doesn't re-run signature
//! verification for the same token repeatedly.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, DecodingKey, Validation};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::models::Identity;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has expired")]
    TokenExpired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: uuid::Uuid,
    username: String,
    exp: i64,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, bearer_token: &str) -> Result<Identity, AuthError>;
}

/// HS256 JWT authenticator with a short-lived validation cache keyed by the
/// raw token, so re-validating a token a connected client presents again
/// (e.g. a reconnect after a transient network blip) is a cache hit.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    cache: Cache<String, Identity>,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, bearer_token: &str) -> Result<Identity, AuthError> {
        if let Some(identity) = self.cache.get(bearer_token).await {
            return Ok(identity);
        }

        let data = decode::<Claims>(bearer_token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        let identity = Identity {
            user_id: data.claims.sub,
            username: data.claims.username,
        };
        self.cache
            .insert(bearer_token.to_string(), identity.clone())
            .await;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(secret: &str, user_id: uuid::Uuid, username: &str, exp: i64) -> String {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let auth = JwtAuthenticator::new("test-secret");
        let user_id = uuid::Uuid::new_v4();
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = token_for("test-secret", user_id, "alice", exp);

        let identity = auth.authenticate(&token).await.unwrap();
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let auth = JwtAuthenticator::new("test-secret");
        let token = token_for("test-secret", uuid::Uuid::new_v4(), "alice", 1);
        assert!(matches!(
            auth.authenticate(&token).await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let auth = JwtAuthenticator::new("test-secret");
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = token_for("other-secret", uuid::Uuid::new_v4(), "alice", exp);
        assert!(matches!(
            auth.authenticate(&token).await,
            Err(AuthError::InvalidToken(_))
        ));
    }
}

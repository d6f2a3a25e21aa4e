//! Bearer-token authentication
//!
//! The WebSocket handshake carries a bearer token in the query string
//! (browsers cannot set headers on WebSocket upgrades). `JwtAuth` validates
//! it as an HS256 JWT whose subject is the user id; any failure closes the
//! socket with 1008 before a single message flows.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AuthPort, PortError};
use crate::types::UserId;

/// JWT claims carried by room tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Issued at
    pub iat: i64,
    /// Expiration time
    pub exp: i64,
}

/// HS256 validator for the `token` query parameter
pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `user_id`. Login flows live outside the core; this
    /// exists for operational tooling and the test suite.
    pub fn issue(&self, user_id: UserId, ttl: Duration) -> Result<String, PortError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| PortError::Unauthorized(format!("token encode: {e}")))
    }
}

#[async_trait]
impl AuthPort for JwtAuth {
    async fn validate(&self, token: &str) -> Result<UserId, PortError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| PortError::Unauthorized(format!("invalid token: {e}")))?;
        Uuid::parse_str(&data.claims.sub)
            .map_err(|e| PortError::Unauthorized(format!("invalid subject: {e}")))
    }
}

/// Generate a random HS256 secret for deployments that did not set one.
/// Tokens minted against it do not survive a restart.
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_validate() {
        let auth = JwtAuth::new("test-secret", 30);
        let user_id = Uuid::new_v4();
        let token = auth.issue(user_id, Duration::minutes(5)).unwrap();
        assert_eq!(auth.validate(&token).await.unwrap(), user_id);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let auth = JwtAuth::new("secret-a", 30);
        let other = JwtAuth::new("secret-b", 30);
        let token = auth.issue(Uuid::new_v4(), Duration::minutes(5)).unwrap();
        assert!(other.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let auth = JwtAuth::new("test-secret", 0);
        let token = auth
            .issue(Uuid::new_v4(), Duration::minutes(-10))
            .unwrap();
        assert!(auth.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let auth = JwtAuth::new("test-secret", 30);
        assert!(auth.validate("not-a-jwt").await.is_err());
    }

    #[test]
    fn test_generated_secrets_differ() {
        assert_ne!(generate_secret(), generate_secret());
    }
}

//! Access-token issuance.
//!
//! The authority treats access tokens as opaque strings; this module owns
//! their format.

use crate::jwt::claims::Claims;
use crate::refresh::record::{FamilyId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rust_common::PlatformError;
use std::time::Duration;

/// Subject and context for one access token.
#[derive(Debug, Clone)]
pub struct AccessTokenRequest<'a> {
    pub user_id: &'a UserId,
    pub family_id: &'a FamilyId,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccessTokenIssuer: Send + Sync {
    async fn sign(&self, request: &AccessTokenRequest<'_>) -> Result<String, PlatformError>;
}

/// HS256 JWT issuer keyed by a shared secret.
pub struct JwtAccessTokenIssuer {
    issuer: String,
    audience: Vec<String>,
    ttl: Duration,
    key_id: Option<String>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtAccessTokenIssuer {
    pub fn new(issuer: impl Into<String>, audience: Vec<String>, secret: &[u8], ttl: Duration) -> Self {
        JwtAccessTokenIssuer {
            issuer: issuer.into(),
            audience,
            ttl,
            key_id: None,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Decode and verify a token minted by this issuer.
    pub fn verify(&self, token: &str) -> Result<Claims, PlatformError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(self.audience.as_slice());
        validation.validate_nbf = true;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| PlatformError::internal(format!("access token rejected: {}", e)))
    }
}

#[async_trait]
impl AccessTokenIssuer for JwtAccessTokenIssuer {
    async fn sign(&self, request: &AccessTokenRequest<'_>) -> Result<String, PlatformError> {
        let ttl_seconds = i64::try_from(self.ttl.as_secs())
            .map_err(|_| PlatformError::internal("access token ttl out of range"))?;
        let claims = Claims::new(
            self.issuer.clone(),
            request.user_id.to_string(),
            self.audience.clone(),
            request.family_id.to_string(),
            request.issued_at,
            ttl_seconds,
        );

        let mut header = Header::new(Algorithm::HS256);
        header.kid = self.key_id.clone();

        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| PlatformError::internal(format!("access token signing failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-key-for-testing-only-32b";

    fn issuer() -> JwtAccessTokenIssuer {
        JwtAccessTokenIssuer::new(
            "auth-platform",
            vec!["api".to_string()],
            SECRET,
            Duration::from_secs(900),
        )
        .with_key_id("key-1")
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let issuer = issuer();
        let user_id = UserId::from("user-123");
        let family_id = FamilyId::from("family-1");

        let token = issuer
            .sign(&AccessTokenRequest {
                user_id: &user_id,
                family_id: &family_id,
                issued_at: Utc::now(),
            })
            .await
            .unwrap();

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.sid, "family-1");
        assert_eq!(claims.aud, vec!["api".to_string()]);

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn test_each_token_has_unique_jti() {
        let issuer = issuer();
        let user_id = UserId::from("user-123");
        let family_id = FamilyId::from("family-1");
        let request = AccessTokenRequest {
            user_id: &user_id,
            family_id: &family_id,
            issued_at: Utc::now(),
        };

        let a = issuer.verify(&issuer.sign(&request).await.unwrap()).unwrap();
        let b = issuer.verify(&issuer.sign(&request).await.unwrap()).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[tokio::test]
    async fn test_foreign_secret_rejected() {
        let user_id = UserId::from("user-123");
        let family_id = FamilyId::from("family-1");
        let other = JwtAccessTokenIssuer::new(
            "auth-platform",
            vec!["api".to_string()],
            b"another-secret-key-for-testing-32b!!",
            Duration::from_secs(900),
        );
        let token = other
            .sign(&AccessTokenRequest {
                user_id: &user_id,
                family_id: &family_id,
                issued_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(issuer().verify(&token).is_err());
    }
}

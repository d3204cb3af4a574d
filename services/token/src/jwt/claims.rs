use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    // Standard JWT claims
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,

    /// Refresh-token family the access token was minted under.
    pub sid: String,
}

impl Claims {
    pub fn new(
        issuer: String,
        subject: String,
        audience: Vec<String>,
        session_id: String,
        issued_at: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Self {
        let now = issued_at.timestamp();
        Claims {
            iss: issuer,
            sub: subject,
            aud: audience,
            exp: now + ttl_seconds,
            iat: now,
            nbf: now,
            jti: uuid::Uuid::new_v4().to_string(),
            sid: session_id,
        }
    }

    pub fn is_valid_at(&self, timestamp: i64) -> bool {
        timestamp >= self.nbf && timestamp < self.exp
    }
}

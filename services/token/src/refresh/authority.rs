//! Refresh token rotation with family-based reuse detection.
//!
//! A family starts at login and gains one generation per rotation. Each
//! token can be exchanged exactly once; presenting a token that was already
//! exchanged revokes the whole family before the error is returned.

use crate::error::RotationError;
use crate::jwt::issuer::{AccessTokenIssuer, AccessTokenRequest};
use crate::metrics;
use crate::refresh::generator::RefreshTokenGenerator;
use crate::refresh::record::{FamilyId, RefreshTokenRecord, RevocationReason, TokenId};
use crate::storage::TokenStore;
use crate::validation::{parse_presented_token, validate_reason, validate_user_id};
use chrono::{DateTime, Duration, Utc};
use rust_common::Clock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const REUSE_EVENT: &str = "REFRESH_TOKEN_REUSE";

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Lifetime of each refresh token, counted from its own issuance.
    pub refresh_token_ttl: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            refresh_token_ttl: Duration::days(7),
        }
    }
}

/// Credentials handed back to the client after login or rotation.
#[derive(Clone)]
pub struct IssuedCredentials {
    pub access_token: String,
    /// Opaque `<id>.<secret>` form; only the secret's hash is persisted.
    pub refresh_token: String,
    pub token_id: TokenId,
    pub family_id: FamilyId,
    pub generation: u32,
    pub expires_at: DateTime<Utc>,
}

impl IssuedCredentials {
    fn new(access_token: String, record: &RefreshTokenRecord, secret: &str) -> Self {
        IssuedCredentials {
            access_token,
            refresh_token: RefreshTokenGenerator::compose(&record.id, secret),
            token_id: record.id.clone(),
            family_id: record.family_id.clone(),
            generation: record.generation,
            expires_at: record.expires_at,
        }
    }
}

impl fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("token_id", &self.token_id)
            .field("family_id", &self.family_id)
            .field("generation", &self.generation)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct TokenRotationAuthority {
    store: Arc<dyn TokenStore>,
    issuer: Arc<dyn AccessTokenIssuer>,
    clock: Arc<dyn Clock>,
    policy: RotationPolicy,
}

impl TokenRotationAuthority {
    pub fn new(
        store: Arc<dyn TokenStore>,
        issuer: Arc<dyn AccessTokenIssuer>,
        clock: Arc<dyn Clock>,
        policy: RotationPolicy,
    ) -> Self {
        TokenRotationAuthority {
            store,
            issuer,
            clock,
            policy,
        }
    }

    /// Start a new family for `user_id` (login).
    pub async fn issue(&self, user_id: &str) -> Result<IssuedCredentials, RotationError> {
        timed("issue", self.issue_family(user_id)).await
    }

    /// Exchange a presented refresh token for new credentials.
    ///
    /// Fails with `ReuseDetected` when the token was already exchanged or
    /// revoked; by then every token of its family is revoked.
    pub async fn rotate(&self, presented: &str) -> Result<IssuedCredentials, RotationError> {
        let result = timed("rotate", self.rotate_presented(presented)).await;
        metrics::record_rotation(match &result {
            Ok(_) => "success",
            Err(err) => err.outcome(),
        });
        result
    }

    /// Revoke every token of a family. Returns how many were still
    /// unrevoked; revoking an already revoked family returns 0.
    pub async fn revoke_family(
        &self,
        family_id: &FamilyId,
        reason: &str,
    ) -> Result<u64, RotationError> {
        let reason = validate_reason(reason)?;
        timed("revoke_family", async {
            let now = self.clock.now();
            let revoked = self
                .store
                .bulk_revoke_family(family_id, reason.clone(), now)
                .await?;
            metrics::record_tokens_revoked(&reason, revoked);

            info!(
                family_id = %family_id,
                reason = %reason,
                revoked = revoked,
                "Revoked token family"
            );
            Ok::<u64, RotationError>(revoked)
        })
        .await
    }

    /// Revoke every family of a user ("log out everywhere").
    pub async fn revoke_all_for_user(&self, user_id: &str, reason: &str) -> Result<u64, RotationError> {
        let user_id = validate_user_id(user_id)?;
        let reason = validate_reason(reason)?;
        timed("revoke_all_for_user", async {
            let now = self.clock.now();
            let families = self.store.list_families_for_user(&user_id).await?;

            let mut revoked = 0;
            for family_id in &families {
                revoked += self
                    .store
                    .bulk_revoke_family(family_id, reason.clone(), now)
                    .await?;
            }
            metrics::record_tokens_revoked(&reason, revoked);

            info!(
                user_id = %user_id,
                reason = %reason,
                families = families.len(),
                revoked = revoked,
                "Revoked all user token families"
            );
            Ok::<u64, RotationError>(revoked)
        })
        .await
    }

    /// Whether `presented` could currently be rotated. Never writes.
    pub async fn is_valid(&self, presented: &str) -> Result<bool, RotationError> {
        let Ok(presented) = parse_presented_token(presented) else {
            return Ok(false);
        };
        let Some(record) = self.store.find(&presented.id).await? else {
            return Ok(false);
        };
        Ok(RefreshTokenGenerator::verify(presented.secret, &record.secret_hash)
            && record.is_valid_at(self.clock.now()))
    }

    async fn issue_family(&self, user_id: &str) -> Result<IssuedCredentials, RotationError> {
        let user_id = validate_user_id(user_id)?;
        let now = self.clock.now();

        let secret = RefreshTokenGenerator::generate_secret();
        let record = RefreshTokenRecord::new_family(
            user_id,
            RefreshTokenGenerator::hash(&secret),
            now,
            now + self.policy.refresh_token_ttl,
        );

        // Sign before persisting so a signing failure leaves nothing behind.
        let access_token = self.sign_access_token(&record, now).await?;
        let credentials = IssuedCredentials::new(access_token, &record, &secret);
        self.store.insert(record).await?;

        metrics::record_token_issued("refresh", "login");
        metrics::record_token_issued("access", "login");
        info!(
            family_id = %credentials.family_id,
            token_id = %credentials.token_id,
            "Created new token family"
        );

        Ok(credentials)
    }

    async fn rotate_presented(&self, presented: &str) -> Result<IssuedCredentials, RotationError> {
        let presented = parse_presented_token(presented)
            .map_err(|violations| RotationError::invalid(format!("malformed refresh token: {}", violations)))?;
        let now = self.clock.now();

        let record = self
            .store
            .find(&presented.id)
            .await?
            .ok_or(RotationError::NotFound)?;

        // Without the secret the caller never held this token; not a reuse signal.
        if !RefreshTokenGenerator::verify(presented.secret, &record.secret_hash) {
            return Err(RotationError::invalid("refresh token secret mismatch"));
        }
        if record.is_expired_at(now) {
            return Err(RotationError::invalid("refresh token expired"));
        }
        if record.is_revoked() {
            return Err(self.reject_revoked(&record, now).await);
        }

        let secret = RefreshTokenGenerator::generate_secret();
        let successor = record.successor(
            RefreshTokenGenerator::hash(&secret),
            now,
            now + self.policy.refresh_token_ttl,
        );
        let access_token = self.sign_access_token(&successor, now).await?;
        let credentials = IssuedCredentials::new(access_token, &successor, &secret);

        if !self.store.commit_rotation(&record.id, successor, now).await? {
            // Revoked between our read and the conditional write.
            warn!(
                family_id = %record.family_id,
                token_id = %record.id,
                "Lost rotation race"
            );
            return Err(self.cascade_reuse(&record, now).await);
        }

        metrics::record_token_issued("refresh", "rotation");
        metrics::record_token_issued("access", "rotation");
        metrics::record_tokens_revoked(&RevocationReason::Rotated, 1);
        info!(
            family_id = %credentials.family_id,
            generation = credentials.generation,
            "Rotated refresh token"
        );

        Ok(credentials)
    }

    async fn reject_revoked(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) -> RotationError {
        if record.revocation_reason != Some(RevocationReason::ReuseDetected) {
            return self.cascade_reuse(record, now).await;
        }

        // Already caught up in a cascade; the family is dead, so this is
        // an ordinary stale token. Re-running the bulk revoke is a no-op.
        match self
            .store
            .bulk_revoke_family(&record.family_id, RevocationReason::ReuseDetected, now)
            .await
        {
            Ok(revoked) => {
                metrics::record_tokens_revoked(&RevocationReason::ReuseDetected, revoked);
                RotationError::invalid("refresh token revoked")
            }
            Err(err) => err.into(),
        }
    }

    async fn cascade_reuse(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) -> RotationError {
        match self
            .store
            .bulk_revoke_family(&record.family_id, RevocationReason::ReuseDetected, now)
            .await
        {
            Ok(revoked) => {
                metrics::record_tokens_revoked(&RevocationReason::ReuseDetected, revoked);
                metrics::record_security_event(REUSE_EVENT);
                warn!(
                    event_type = REUSE_EVENT,
                    family_id = %record.family_id,
                    user_id = %record.user_id,
                    token_id = %record.id,
                    generation = record.generation,
                    revoked = revoked,
                    "Refresh token reuse detected - revoked token family"
                );
                RotationError::ReuseDetected {
                    family_id: record.family_id.clone(),
                }
            }
            Err(err) => {
                error!(
                    family_id = %record.family_id,
                    error = %err,
                    "Failed to revoke token family after reuse"
                );
                err.into()
            }
        }
    }

    async fn sign_access_token(
        &self,
        record: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<String, RotationError> {
        let token = self
            .issuer
            .sign(&AccessTokenRequest {
                user_id: &record.user_id,
                family_id: &record.family_id,
                issued_at: now,
            })
            .await?;
        Ok(token)
    }
}

async fn timed<F: Future>(operation: &'static str, fut: F) -> F::Output {
    let started = Instant::now();
    let output = fut.await;
    metrics::record_operation_latency(operation, started.elapsed().as_secs_f64());
    output
}

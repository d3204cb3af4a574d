//! Persistent refresh-token storage.
//!
//! Backends must make [`TokenStore::commit_rotation`] and
//! [`TokenStore::bulk_revoke_family`] atomic with respect to every other
//! operation; the authority relies on that for its single-winner guarantee.

pub mod memory;
pub mod redis;

pub use memory::MemoryTokenStore;
pub use redis::RedisTokenStore;

use crate::refresh::record::{FamilyId, RefreshTokenRecord, RevocationReason, TokenId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_common::PlatformError;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find(&self, token_id: &TokenId) -> Result<Option<RefreshTokenRecord>, PlatformError>;

    /// Insert a new record. Fails with `Conflict` if the id is taken.
    async fn insert(&self, record: RefreshTokenRecord) -> Result<(), PlatformError>;

    /// Revoke a single token if it is still unrevoked. Returns whether
    /// this call performed the transition.
    async fn update_revocation(
        &self,
        token_id: &TokenId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError>;

    /// Revoke `presented` as rotated and insert `successor`, as one unit.
    /// Returns false and writes nothing if `presented` is missing or
    /// already revoked.
    async fn commit_rotation(
        &self,
        presented: &TokenId,
        successor: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError>;

    /// Revoke every unrevoked token of the family in one update. Tokens
    /// already revoked keep their reason. Returns the number revoked.
    async fn bulk_revoke_family(
        &self,
        family_id: &FamilyId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, PlatformError>;

    async fn list_families_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyId>, PlatformError>;
}

//! In-process token store.
//!
//! Every operation runs under one write (or read) guard, which gives the
//! same all-or-nothing semantics a row lock gives a relational backend.

use crate::refresh::record::{FamilyId, RefreshTokenRecord, RevocationReason, TokenId, UserId};
use crate::storage::TokenStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_common::PlatformError;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Inner {
    tokens: HashMap<TokenId, RefreshTokenRecord>,
    families: HashMap<FamilyId, Vec<TokenId>>,
    user_families: HashMap<UserId, BTreeSet<FamilyId>>,
}

impl Inner {
    fn insert(&mut self, record: RefreshTokenRecord) -> Result<(), PlatformError> {
        if self.tokens.contains_key(&record.id) {
            return Err(PlatformError::conflict(format!("token {} exists", record.id)));
        }
        self.families
            .entry(record.family_id.clone())
            .or_default()
            .push(record.id.clone());
        self.user_families
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.family_id.clone());
        self.tokens.insert(record.id.clone(), record);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    inner: RwLock<Inner>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop tokens that expired before `before`. Dropped tokens are
    /// afterwards reported as unknown.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().await;
        let expired: Vec<TokenId> = inner
            .tokens
            .values()
            .filter(|record| record.expires_at < before)
            .map(|record| record.id.clone())
            .collect();

        for id in &expired {
            let Some(record) = inner.tokens.remove(id) else {
                continue;
            };
            let family_empty = match inner.families.get_mut(&record.family_id) {
                Some(members) => {
                    members.retain(|member| member != id);
                    members.is_empty()
                }
                None => true,
            };
            if family_empty {
                inner.families.remove(&record.family_id);
                if let Some(families) = inner.user_families.get_mut(&record.user_id) {
                    families.remove(&record.family_id);
                    if families.is_empty() {
                        inner.user_families.remove(&record.user_id);
                    }
                }
            }
        }

        debug!(purged = expired.len(), "Purged expired refresh tokens");
        expired.len()
    }

    pub async fn token_count(&self) -> usize {
        self.inner.read().await.tokens.len()
    }

    /// Every record of a family, oldest generation first.
    pub async fn family_members(&self, family_id: &FamilyId) -> Vec<RefreshTokenRecord> {
        let inner = self.inner.read().await;
        let mut members: Vec<RefreshTokenRecord> = inner
            .families
            .get(family_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.tokens.get(id).cloned())
            .collect();
        members.sort_by_key(|record| record.generation);
        members
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn find(&self, token_id: &TokenId) -> Result<Option<RefreshTokenRecord>, PlatformError> {
        Ok(self.inner.read().await.tokens.get(token_id).cloned())
    }

    async fn insert(&self, record: RefreshTokenRecord) -> Result<(), PlatformError> {
        self.inner.write().await.insert(record)
    }

    async fn update_revocation(
        &self,
        token_id: &TokenId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .tokens
            .get_mut(token_id)
            .is_some_and(|record| record.revoke(reason, now)))
    }

    async fn commit_rotation(
        &self,
        presented: &TokenId,
        successor: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError> {
        let mut inner = self.inner.write().await;

        match inner.tokens.get(presented) {
            Some(record) if !record.is_revoked() => {}
            _ => return Ok(false),
        }
        if inner.tokens.contains_key(&successor.id) {
            return Err(PlatformError::conflict(format!("token {} exists", successor.id)));
        }

        let successor_id = successor.id.clone();
        if let Some(record) = inner.tokens.get_mut(presented) {
            record.revoke(RevocationReason::Rotated, now);
            record.superseded_by = Some(successor_id);
        }
        inner.insert(successor)?;
        Ok(true)
    }

    async fn bulk_revoke_family(
        &self,
        family_id: &FamilyId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, PlatformError> {
        let mut inner = self.inner.write().await;
        let Inner {
            tokens, families, ..
        } = &mut *inner;

        let mut revoked = 0;
        for id in families.get(family_id).into_iter().flatten() {
            if let Some(record) = tokens.get_mut(id) {
                if record.revoke(reason.clone(), now) {
                    revoked += 1;
                }
            }
        }
        Ok(revoked)
    }

    async fn list_families_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyId>, PlatformError> {
        let inner = self.inner.read().await;
        Ok(inner
            .user_families
            .get(user_id)
            .map(|families| families.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn family_head(user: &str, now: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord::new_family(
            UserId::from(user),
            "hash".to_string(),
            now,
            now + Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let record = family_head("user-1", now);

        store.insert(record.clone()).await.unwrap();

        assert_eq!(store.find(&record.id).await.unwrap(), Some(record.clone()));
        assert!(matches!(
            store.insert(record).await,
            Err(PlatformError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_revocation_is_conditional() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let record = family_head("user-1", now);
        store.insert(record.clone()).await.unwrap();

        assert!(store
            .update_revocation(&record.id, RevocationReason::Logout, now)
            .await
            .unwrap());
        assert!(!store
            .update_revocation(&record.id, RevocationReason::ReuseDetected, now)
            .await
            .unwrap());
        assert!(!store
            .update_revocation(&TokenId::from("missing"), RevocationReason::Logout, now)
            .await
            .unwrap());

        let stored = store.find(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.revocation_reason, Some(RevocationReason::Logout));
    }

    #[tokio::test]
    async fn test_commit_rotation_single_winner() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let head = family_head("user-1", now);
        store.insert(head.clone()).await.unwrap();

        let first = head.successor("h1".to_string(), now, now + Duration::hours(1));
        let second = head.successor("h2".to_string(), now, now + Duration::hours(1));

        assert!(store.commit_rotation(&head.id, first.clone(), now).await.unwrap());
        assert!(!store.commit_rotation(&head.id, second.clone(), now).await.unwrap());

        let stored = store.find(&head.id).await.unwrap().unwrap();
        assert_eq!(stored.revocation_reason, Some(RevocationReason::Rotated));
        assert_eq!(stored.superseded_by, Some(first.id.clone()));
        assert!(store.find(&second.id).await.unwrap().is_none());
        assert_eq!(store.family_members(&head.family_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_revoke_keeps_existing_reasons() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let head = family_head("user-1", now);
        store.insert(head.clone()).await.unwrap();
        let next = head.successor("h1".to_string(), now, now + Duration::hours(1));
        store.commit_rotation(&head.id, next.clone(), now).await.unwrap();

        let revoked = store
            .bulk_revoke_family(&head.family_id, RevocationReason::ReuseDetected, now)
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        let members = store.family_members(&head.family_id).await;
        assert_eq!(members[0].revocation_reason, Some(RevocationReason::Rotated));
        assert_eq!(members[1].revocation_reason, Some(RevocationReason::ReuseDetected));

        let again = store
            .bulk_revoke_family(&head.family_id, RevocationReason::ReuseDetected, now)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_list_families_for_user() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let a = family_head("user-1", now);
        let b = family_head("user-1", now);
        let other = family_head("user-2", now);
        for record in [a.clone(), b.clone(), other] {
            store.insert(record).await.unwrap();
        }

        let mut families = store
            .list_families_for_user(&UserId::from("user-1"))
            .await
            .unwrap();
        families.sort();
        let mut expected = vec![a.family_id, b.family_id];
        expected.sort();
        assert_eq!(families, expected);

        assert!(store
            .list_families_for_user(&UserId::from("nobody"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let record = family_head("user-1", now);
        store.insert(record.clone()).await.unwrap();

        assert_eq!(store.purge_expired(now).await, 0);
        assert_eq!(store.purge_expired(now + Duration::hours(2)).await, 1);

        assert!(store.find(&record.id).await.unwrap().is_none());
        assert_eq!(store.token_count().await, 0);
        assert!(store
            .list_families_for_user(&UserId::from("user-1"))
            .await
            .unwrap()
            .is_empty());
    }
}

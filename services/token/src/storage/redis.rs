//! Redis-backed token store.
//!
//! Records are hashes under `<prefix>:token:<id>`; family membership and
//! per-user families are sets. Every write that must be atomic runs as a
//! Lua script so no client ever observes a half-applied rotation or a
//! partially revoked family.
//!
//! Index sets expire with their newest member (expiry plus retention) and
//! members whose key is gone are dropped when the set is next walked.
//!
//! The family and user scripts derive token and family keys from set
//! members rather than receiving them in `KEYS`, so this backend requires
//! a single-node (or single-shard) Redis. It is not Redis Cluster safe.

use crate::refresh::record::{FamilyId, RefreshTokenRecord, RevocationReason, TokenId, UserId};
use crate::storage::TokenStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_common::PlatformError;
use std::collections::HashMap;
use tracing::info;

// Pushes a key's expiry out to `at` (unix ms); never shortens it.
const EXTEND_EXPIRY: &str = r"
local function extend_expiry(key, at)
  local clock = redis.call('TIME')
  local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)
  local ttl = redis.call('PTTL', key)
  if ttl < 0 or now + ttl < at then
    redis.call('PEXPIREAT', key, at)
  end
end
";

// KEYS: token, family set, user set
// ARGV: id, family id, expire-at ms, field/value pairs...
const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], unpack(ARGV, 4))
redis.call('PEXPIREAT', KEYS[1], ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
extend_expiry(KEYS[2], tonumber(ARGV[3]))
extend_expiry(KEYS[3], tonumber(ARGV[3]))
return 1
";

// KEYS: token
// ARGV: revoked_at, reason
const REVOKE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local revoked = redis.call('HGET', KEYS[1], 'revoked_at')
if revoked and revoked ~= '' then return 0 end
redis.call('HSET', KEYS[1], 'revoked_at', ARGV[1], 'revocation_reason', ARGV[2])
return 1
";

// KEYS: presented, successor, family set, user set
// ARGV: revoked_at, successor id, family id, successor expire-at ms, field/value pairs...
const ROTATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local revoked = redis.call('HGET', KEYS[1], 'revoked_at')
if revoked and revoked ~= '' then return 0 end
if redis.call('EXISTS', KEYS[2]) == 1 then return -1 end
redis.call('HSET', KEYS[1], 'revoked_at', ARGV[1], 'revocation_reason', 'rotated', 'superseded_by', ARGV[2])
redis.call('HSET', KEYS[2], unpack(ARGV, 5))
redis.call('PEXPIREAT', KEYS[2], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('SADD', KEYS[4], ARGV[3])
extend_expiry(KEYS[3], tonumber(ARGV[4]))
extend_expiry(KEYS[4], tonumber(ARGV[4]))
return 1
";

// KEYS: family set
// ARGV: token key prefix, revoked_at, reason
const BULK_REVOKE_SCRIPT: &str = r"
local count = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local key = ARGV[1] .. id
  if redis.call('EXISTS', key) == 1 then
    local revoked = redis.call('HGET', key, 'revoked_at')
    if not revoked or revoked == '' then
      redis.call('HSET', key, 'revoked_at', ARGV[2], 'revocation_reason', ARGV[3])
      count = count + 1
    end
  else
    redis.call('SREM', KEYS[1], id)
  end
end
return count
";

// KEYS: user set
// ARGV: family key prefix
const LIST_FAMILIES_SCRIPT: &str = r"
local live = {}
for _, family in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. family) == 1 then
    table.insert(live, family)
  else
    redis.call('SREM', KEYS[1], family)
  end
end
return live
";

pub struct RedisTokenStore {
    conn: ConnectionManager,
    prefix: String,
    retention: Duration,
    insert_script: Script,
    revoke_script: Script,
    rotate_script: Script,
    bulk_revoke_script: Script,
    list_families_script: Script,
}

impl RedisTokenStore {
    /// Connect to Redis. Token keys are kept for `retention` past their
    /// expiry so revoked lineages stay inspectable.
    pub async fn new(
        redis_url: &str,
        prefix: impl Into<String>,
        retention: Duration,
    ) -> Result<Self, PlatformError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "Connected Redis token store");

        Ok(RedisTokenStore {
            conn,
            prefix,
            retention,
            insert_script: Script::new(&format!("{}{}", EXTEND_EXPIRY, INSERT_SCRIPT)),
            revoke_script: Script::new(REVOKE_SCRIPT),
            rotate_script: Script::new(&format!("{}{}", EXTEND_EXPIRY, ROTATE_SCRIPT)),
            bulk_revoke_script: Script::new(BULK_REVOKE_SCRIPT),
            list_families_script: Script::new(LIST_FAMILIES_SCRIPT),
        })
    }

    fn token_key_prefix(&self) -> String {
        format!("{}:token:", self.prefix)
    }

    fn token_key(&self, id: &TokenId) -> String {
        format!("{}{}", self.token_key_prefix(), id)
    }

    fn family_key_prefix(&self) -> String {
        format!("{}:family:", self.prefix)
    }

    fn family_key(&self, family_id: &FamilyId) -> String {
        format!("{}{}", self.family_key_prefix(), family_id)
    }

    fn user_key(&self, user_id: &UserId) -> String {
        format!("{}:user_families:{}", self.prefix, user_id)
    }

    fn key_expire_at(&self, record: &RefreshTokenRecord) -> i64 {
        expire_at_millis(record.expires_at, self.retention)
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn find(&self, token_id: &TokenId) -> Result<Option<RefreshTokenRecord>, PlatformError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.token_key(token_id))
            .await
            .map_err(unavailable)?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(&fields).map(Some)
    }

    async fn insert(&self, record: RefreshTokenRecord) -> Result<(), PlatformError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.insert_script.prepare_invoke();
        invocation
            .key(self.token_key(&record.id))
            .key(self.family_key(&record.family_id))
            .key(self.user_key(&record.user_id))
            .arg(record.id.as_str())
            .arg(record.family_id.as_str())
            .arg(self.key_expire_at(&record));
        for (field, value) in record_to_fields(&record) {
            invocation.arg(field).arg(value);
        }

        let inserted: i64 = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        if inserted == 0 {
            return Err(PlatformError::conflict(format!("token {} exists", record.id)));
        }
        Ok(())
    }

    async fn update_revocation(
        &self,
        token_id: &TokenId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.revoke_script.prepare_invoke();
        invocation
            .key(self.token_key(token_id))
            .arg(format_timestamp(now))
            .arg(reason.as_str());

        let revoked: i64 = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        Ok(revoked == 1)
    }

    async fn commit_rotation(
        &self,
        presented: &TokenId,
        successor: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, PlatformError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.rotate_script.prepare_invoke();
        invocation
            .key(self.token_key(presented))
            .key(self.token_key(&successor.id))
            .key(self.family_key(&successor.family_id))
            .key(self.user_key(&successor.user_id))
            .arg(format_timestamp(now))
            .arg(successor.id.as_str())
            .arg(successor.family_id.as_str())
            .arg(self.key_expire_at(&successor));
        for (field, value) in record_to_fields(&successor) {
            invocation.arg(field).arg(value);
        }

        let committed: i64 = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        match committed {
            1 => Ok(true),
            -1 => Err(PlatformError::conflict(format!("token {} exists", successor.id))),
            _ => Ok(false),
        }
    }

    async fn bulk_revoke_family(
        &self,
        family_id: &FamilyId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, PlatformError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.bulk_revoke_script.prepare_invoke();
        invocation
            .key(self.family_key(family_id))
            .arg(self.token_key_prefix())
            .arg(format_timestamp(now))
            .arg(reason.as_str());

        let revoked: u64 = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        Ok(revoked)
    }

    async fn list_families_for_user(&self, user_id: &UserId) -> Result<Vec<FamilyId>, PlatformError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.list_families_script.prepare_invoke();
        invocation
            .key(self.user_key(user_id))
            .arg(self.family_key_prefix());

        let ids: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
        Ok(ids.into_iter().map(FamilyId::from).collect())
    }
}

fn unavailable(err: redis::RedisError) -> PlatformError {
    PlatformError::unavailable(format!("redis: {}", err))
}

/// Unix ms at which keys for a token expiring at `expires_at` may go.
fn expire_at_millis(expires_at: DateTime<Utc>, retention: Duration) -> i64 {
    (expires_at + retention).timestamp_millis()
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, PlatformError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| PlatformError::corrupt(format!("{}: {}", field, e)))
}

fn record_to_fields(record: &RefreshTokenRecord) -> Vec<(&'static str, String)> {
    vec![
        ("id", record.id.to_string()),
        ("user_id", record.user_id.to_string()),
        ("family_id", record.family_id.to_string()),
        ("generation", record.generation.to_string()),
        ("secret_hash", record.secret_hash.clone()),
        ("issued_at", format_timestamp(record.issued_at)),
        ("expires_at", format_timestamp(record.expires_at)),
        (
            "revoked_at",
            record.revoked_at.map(format_timestamp).unwrap_or_default(),
        ),
        (
            "revocation_reason",
            record
                .revocation_reason
                .as_ref()
                .map(|reason| reason.as_str().to_string())
                .unwrap_or_default(),
        ),
        (
            "superseded_by",
            record
                .superseded_by
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        ),
    ]
}

fn record_from_fields(fields: &HashMap<String, String>) -> Result<RefreshTokenRecord, PlatformError> {
    let required = |name: &str| -> Result<&str, PlatformError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PlatformError::corrupt(format!("missing field {}", name)))
    };
    let optional = |name: &str| fields.get(name).map(String::as_str).filter(|v| !v.is_empty());

    let generation = required("generation")?
        .parse::<u32>()
        .map_err(|e| PlatformError::corrupt(format!("generation: {}", e)))?;
    let revoked_at = optional("revoked_at")
        .map(|v| parse_timestamp("revoked_at", v))
        .transpose()?;

    Ok(RefreshTokenRecord {
        id: TokenId::from(required("id")?),
        user_id: UserId::from(required("user_id")?),
        family_id: FamilyId::from(required("family_id")?),
        generation,
        secret_hash: required("secret_hash")?.to_string(),
        issued_at: parse_timestamp("issued_at", required("issued_at")?)?,
        expires_at: parse_timestamp("expires_at", required("expires_at")?)?,
        revoked_at,
        revocation_reason: optional("revocation_reason").map(RevocationReason::parse),
        superseded_by: optional("superseded_by").map(TokenId::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord::new_family(
            UserId::from("user-1"),
            "hash".to_string(),
            now,
            now + Duration::days(7),
        )
    }

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_fields_preserve_active_record() {
        let record = sample(Utc::now());
        let restored = record_from_fields(&as_map(record_to_fields(&record))).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_fields_preserve_revocation() {
        let now = Utc::now();
        let mut record = sample(now);
        record.revoke(RevocationReason::Rotated, now);
        record.superseded_by = Some(TokenId::from("next"));

        let restored = record_from_fields(&as_map(record_to_fields(&record))).unwrap();
        assert_eq!(restored.revocation_reason, Some(RevocationReason::Rotated));
        assert_eq!(restored.superseded_by, Some(TokenId::from("next")));
        assert!(restored.is_revoked());
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let mut fields = as_map(record_to_fields(&sample(Utc::now())));
        fields.remove("expires_at");
        assert!(matches!(
            record_from_fields(&fields),
            Err(PlatformError::Corrupt(_))
        ));
    }

    #[test]
    fn test_index_expiry_covers_retention() {
        let expires_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            expire_at_millis(expires_at, Duration::hours(1)),
            1_700_000_000_000 + 3_600_000
        );

        let later = expires_at + Duration::days(7);
        assert!(expire_at_millis(later, Duration::zero()) > expire_at_millis(expires_at, Duration::hours(1)));

        for script in [INSERT_SCRIPT, ROTATE_SCRIPT] {
            assert_eq!(script.matches("extend_expiry(KEYS[").count(), 2);
        }
        assert!(BULK_REVOKE_SCRIPT.contains("SREM"));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_redis_index_sets_expire_and_prune() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("rotation-test-{}", uuid::Uuid::new_v4());
        let store = RedisTokenStore::new(&url, prefix, Duration::hours(1))
            .await
            .unwrap();
        let mut conn = store.conn.clone();

        let now = Utc::now();
        let head = sample(now);
        let family_key = store.family_key(&head.family_id);
        let user_key = store.user_key(&head.user_id);
        store.insert(head.clone()).await.unwrap();

        let family_ttl: i64 = conn.pttl(&family_key).await.unwrap();
        let user_ttl: i64 = conn.pttl(&user_key).await.unwrap();
        let ceiling = expire_at_millis(head.expires_at, Duration::hours(1)) - now.timestamp_millis();
        assert!(family_ttl > 0 && family_ttl <= ceiling + 60_000);
        assert!(user_ttl > 0 && user_ttl <= ceiling + 60_000);

        let next = head.successor("h1".to_string(), now, now + Duration::days(14));
        assert!(store.commit_rotation(&head.id, next.clone(), now).await.unwrap());
        let extended: i64 = conn.pttl(&family_key).await.unwrap();
        assert!(extended > family_ttl + Duration::days(6).num_milliseconds());

        let _: i64 = conn.del(store.token_key(&head.id)).await.unwrap();
        let revoked = store
            .bulk_revoke_family(&head.family_id, RevocationReason::Logout, now)
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        let members: Vec<String> = conn.smembers(&family_key).await.unwrap();
        assert_eq!(members, vec![next.id.to_string()]);

        let _: i64 = conn.del(&family_key).await.unwrap();
        assert!(store
            .list_families_for_user(&head.user_id)
            .await
            .unwrap()
            .is_empty());
        let remaining: i64 = conn.scard(&user_key).await.unwrap();
        assert_eq!(remaining, 0);

        let _: i64 = conn.del(store.token_key(&next.id)).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_redis_rotation_round() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("rotation-test-{}", uuid::Uuid::new_v4());
        let store = RedisTokenStore::new(&url, prefix, Duration::hours(1))
            .await
            .unwrap();

        let now = Utc::now();
        let head = sample(now);
        store.insert(head.clone()).await.unwrap();
        let next = head.successor("h1".to_string(), now, now + Duration::days(7));

        assert!(store.commit_rotation(&head.id, next.clone(), now).await.unwrap());
        assert!(!store
            .commit_rotation(&head.id, head.successor("h2".to_string(), now, now), now)
            .await
            .unwrap());

        let revoked = store
            .bulk_revoke_family(&head.family_id, RevocationReason::ReuseDetected, now)
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        let stored = store.find(&head.id).await.unwrap().unwrap();
        assert_eq!(stored.revocation_reason, Some(RevocationReason::Rotated));
        let stored = store.find(&next.id).await.unwrap().unwrap();
        assert_eq!(stored.revocation_reason, Some(RevocationReason::ReuseDetected));
        assert_eq!(
            store.list_families_for_user(&head.user_id).await.unwrap(),
            vec![head.family_id.clone()]
        );
    }
}

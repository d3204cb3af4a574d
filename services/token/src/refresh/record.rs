use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of one refresh-token issuance.
    TokenId
);
string_id!(
    /// Lineage shared by every rotation descendant of one login.
    FamilyId
);
string_id!(
    /// Owning principal.
    UserId
);

impl TokenId {
    pub fn generate() -> Self {
        TokenId(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&TokenId> for FamilyId {
    fn from(id: &TokenId) -> Self {
        FamilyId(id.0.clone())
    }
}

/// Why a token left the Active state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RevocationReason {
    Rotated,
    ReuseDetected,
    Logout,
    Other(String),
}

impl RevocationReason {
    pub fn as_str(&self) -> &str {
        match self {
            RevocationReason::Rotated => "rotated",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::Logout => "logout",
            RevocationReason::Other(reason) => reason,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "rotated" => RevocationReason::Rotated,
            "reuse_detected" => RevocationReason::ReuseDetected,
            "logout" => RevocationReason::Logout,
            other => RevocationReason::Other(other.to_string()),
        }
    }

    /// Reasons only the authority itself may record.
    pub fn is_reserved(&self) -> bool {
        matches!(self, RevocationReason::Rotated | RevocationReason::ReuseDetected)
    }

    /// Bounded label for metrics; caller-defined reasons share one series.
    pub fn metric_label(&self) -> &'static str {
        match self {
            RevocationReason::Rotated => "rotated",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::Logout => "logout",
            RevocationReason::Other(_) => "other",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RevocationReason {
    fn from(value: String) -> Self {
        RevocationReason::parse(&value)
    }
}

impl From<RevocationReason> for String {
    fn from(reason: RevocationReason) -> Self {
        reason.as_str().to_string()
    }
}

/// Lifecycle state at a given instant. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Expired,
    Revoked(RevocationReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: TokenId,
    pub user_id: UserId,
    pub family_id: FamilyId,
    pub generation: u32,
    pub secret_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
    pub superseded_by: Option<TokenId>,
}

impl RefreshTokenRecord {
    /// First token of a new family; its id doubles as the family id.
    pub fn new_family(
        user_id: UserId,
        secret_hash: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let id = TokenId::generate();
        RefreshTokenRecord {
            family_id: FamilyId::from(&id),
            id,
            user_id,
            generation: 0,
            secret_hash,
            issued_at,
            expires_at,
            revoked_at: None,
            revocation_reason: None,
            superseded_by: None,
        }
    }

    /// Next generation in the same family.
    pub fn successor(
        &self,
        secret_hash: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        RefreshTokenRecord {
            id: TokenId::generate(),
            user_id: self.user_id.clone(),
            family_id: self.family_id.clone(),
            generation: self.generation + 1,
            secret_hash,
            issued_at,
            expires_at,
            revoked_at: None,
            revocation_reason: None,
            superseded_by: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Not revoked and not expired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> TokenState {
        if self.is_revoked() {
            let reason = self
                .revocation_reason
                .clone()
                .unwrap_or_else(|| RevocationReason::Other("unknown".to_string()));
            TokenState::Revoked(reason)
        } else if self.is_expired_at(now) {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }

    /// Set the terminal revocation marker. Returns false, leaving the
    /// record untouched, if it was already revoked.
    pub fn revoke(&mut self, reason: RevocationReason, now: DateTime<Utc>) -> bool {
        if self.is_revoked() {
            return false;
        }
        self.revoked_at = Some(now);
        self.revocation_reason = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord::new_family(
            UserId::from("user-1"),
            "hash-1".to_string(),
            now,
            now + Duration::hours(1),
        )
    }

    #[test]
    fn test_new_family_is_generation_zero() {
        let now = Utc::now();
        let token = record(now);

        assert_eq!(token.generation, 0);
        assert_eq!(token.family_id.as_str(), token.id.as_str());
        assert_eq!(token.state_at(now), TokenState::Active);
    }

    #[test]
    fn test_successor_keeps_family() {
        let now = Utc::now();
        let token = record(now);
        let next = token.successor("hash-2".to_string(), now, now + Duration::hours(1));

        assert_eq!(next.family_id, token.family_id);
        assert_eq!(next.user_id, token.user_id);
        assert_eq!(next.generation, 1);
        assert_ne!(next.id, token.id);
    }

    #[test]
    fn test_revoke_is_set_once() {
        let now = Utc::now();
        let mut token = record(now);

        assert!(token.revoke(RevocationReason::Rotated, now));
        assert!(!token.revoke(RevocationReason::ReuseDetected, now + Duration::seconds(5)));

        assert_eq!(token.revocation_reason, Some(RevocationReason::Rotated));
        assert_eq!(token.revoked_at, Some(now));
        assert_eq!(token.state_at(now), TokenState::Revoked(RevocationReason::Rotated));
    }

    #[test]
    fn test_expiry_is_lazy() {
        let now = Utc::now();
        let token = record(now);

        assert!(token.is_valid_at(now));
        assert!(!token.is_valid_at(token.expires_at));
        assert_eq!(token.state_at(token.expires_at), TokenState::Expired);
    }

    #[test]
    fn test_revoked_reported_before_expired() {
        let now = Utc::now();
        let mut token = record(now);
        token.revoke(RevocationReason::Logout, now);

        let later = now + Duration::days(2);
        assert_eq!(token.state_at(later), TokenState::Revoked(RevocationReason::Logout));
    }

    #[test]
    fn test_reason_round_trips_through_string() {
        for reason in [
            RevocationReason::Rotated,
            RevocationReason::ReuseDetected,
            RevocationReason::Logout,
            RevocationReason::Other("admin_revoked".to_string()),
        ] {
            assert_eq!(RevocationReason::parse(reason.as_str()), reason);
        }

        let json = serde_json::to_string(&RevocationReason::ReuseDetected).unwrap();
        assert_eq!(json, "\"reuse_detected\"");
    }

    #[test]
    fn test_reserved_reasons_and_labels() {
        assert!(RevocationReason::Rotated.is_reserved());
        assert!(RevocationReason::ReuseDetected.is_reserved());
        assert!(!RevocationReason::Logout.is_reserved());
        assert!(!RevocationReason::Other("admin_revoked".to_string()).is_reserved());

        assert_eq!(RevocationReason::Logout.metric_label(), "logout");
        assert_eq!(
            RevocationReason::Other("admin_revoked".to_string()).metric_label(),
            "other"
        );
    }
}

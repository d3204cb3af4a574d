//! Input validation for authority operations.
//!
//! Each function either returns the parsed value or every violation found,
//! so callers can report all problems at once.

use crate::refresh::generator::{PRESENTED_SEPARATOR, SECRET_LEN};
use crate::refresh::record::{RevocationReason, TokenId, UserId};
use std::fmt;

const MAX_USER_ID_LEN: usize = 128;
const MAX_REASON_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Violation {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Non-empty list of violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(Vec<Violation>);

impl Violations {
    pub fn single(violation: Violation) -> Self {
        Violations(vec![violation])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn check(found: Vec<Violation>) -> Result<(), Violations> {
        if found.is_empty() {
            Ok(())
        } else {
            Err(Violations(found))
        }
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

pub fn validate_user_id(raw: &str) -> Result<UserId, Violations> {
    let mut found = Vec::new();
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        found.push(Violation::new("user_id", "must not be empty"));
    }
    if raw.chars().count() > MAX_USER_ID_LEN {
        found.push(Violation::new(
            "user_id",
            format!("must be at most {} characters", MAX_USER_ID_LEN),
        ));
    }
    if !trimmed.is_empty() && raw.chars().any(|c| c.is_control() || c.is_whitespace()) {
        found.push(Violation::new(
            "user_id",
            "must not contain whitespace or control characters",
        ));
    }

    Violations::check(found)?;
    Ok(UserId::from(raw))
}

pub fn validate_reason(raw: &str) -> Result<RevocationReason, Violations> {
    let mut found = Vec::new();

    if raw.is_empty() {
        found.push(Violation::new("reason", "must not be empty"));
    }
    if raw.len() > MAX_REASON_LEN {
        found.push(Violation::new(
            "reason",
            format!("must be at most {} characters", MAX_REASON_LEN),
        ));
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        found.push(Violation::new(
            "reason",
            "may only contain lowercase letters, digits and underscores",
        ));
    }

    Violations::check(found)?;

    let reason = RevocationReason::parse(raw);
    if reason.is_reserved() {
        return Err(Violations::single(Violation::new(
            "reason",
            format!("{} is recorded by the service and cannot be requested", raw),
        )));
    }
    Ok(reason)
}

/// Presented refresh token split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedToken<'a> {
    pub id: TokenId,
    pub secret: &'a str,
}

pub fn parse_presented_token(raw: &str) -> Result<PresentedToken<'_>, Violations> {
    let Some((id, secret)) = raw.split_once(PRESENTED_SEPARATOR) else {
        return Err(Violations::single(Violation::new(
            "refresh_token",
            "expected <id>.<secret>",
        )));
    };

    let mut found = Vec::new();
    if uuid::Uuid::parse_str(id).is_err() {
        found.push(Violation::new("refresh_token", "token id is not a UUID"));
    }
    let secret_ok = secret.len() == SECRET_LEN
        && secret
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !secret_ok {
        found.push(Violation::new("refresh_token", "malformed secret"));
    }

    Violations::check(found)?;
    Ok(PresentedToken {
        id: TokenId::from(id),
        secret,
    })
}

use crate::refresh::record::FamilyId;
use crate::validation::Violations;
use rust_common::PlatformError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Refresh token not found")]
    NotFound,

    #[error("Refresh token invalid: {0}")]
    Invalid(String),

    #[error("Refresh token reused - family {family_id} revoked")]
    ReuseDetected { family_id: FamilyId },

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Validation failed: {0}")]
    Validation(Violations),
}

impl RotationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RotationError::Invalid(msg.into())
    }

    /// Ordinary client errors: reported, never retried, never alarmed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RotationError::NotFound | RotationError::Invalid(_) | RotationError::Validation(_)
        )
    }

    /// Replay of a superseded token. The family is already revoked when
    /// this is returned.
    pub fn is_security_event(&self) -> bool {
        matches!(self, RotationError::ReuseDetected { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RotationError::Unavailable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            RotationError::NotFound => TOKEN_REFRESH_NOT_FOUND,
            RotationError::Invalid(_) => TOKEN_REFRESH_INVALID,
            RotationError::ReuseDetected { .. } => TOKEN_REFRESH_REUSED,
            RotationError::Unavailable(_) => TOKEN_DEPENDENCY_UNAVAILABLE,
            RotationError::Validation(_) => TOKEN_REQUEST_INVALID,
        }
    }

    /// Outcome label used by metrics.
    pub(crate) fn outcome(&self) -> &'static str {
        match self {
            RotationError::NotFound => "not_found",
            RotationError::Invalid(_) => "invalid",
            RotationError::ReuseDetected { .. } => "reuse_detected",
            RotationError::Unavailable(_) => "unavailable",
            RotationError::Validation(_) => "validation",
        }
    }
}

impl From<PlatformError> for RotationError {
    fn from(err: PlatformError) -> Self {
        RotationError::Unavailable(err.to_string())
    }
}

impl From<Violations> for RotationError {
    fn from(violations: Violations) -> Self {
        RotationError::Validation(violations)
    }
}

// Error codes for the request layer
pub const TOKEN_REFRESH_NOT_FOUND: &str = "TOKEN_REFRESH_NOT_FOUND";
pub const TOKEN_REFRESH_INVALID: &str = "TOKEN_REFRESH_INVALID";
pub const TOKEN_REFRESH_REUSED: &str = "TOKEN_REFRESH_REUSED";
pub const TOKEN_DEPENDENCY_UNAVAILABLE: &str = "TOKEN_DEPENDENCY_UNAVAILABLE";
pub const TOKEN_REQUEST_INVALID: &str = "TOKEN_REQUEST_INVALID";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Missing {0}")]
    Missing(&'static str),
}

impl ConfigError {
    pub fn invalid(name: &'static str, reason: impl std::fmt::Display) -> Self {
        ConfigError::InvalidValue {
            name,
            reason: reason.to_string(),
        }
    }
}

//! Token rotation service library.
//!
//! Issues refresh-token families, rotates tokens exactly once, detects
//! reuse of superseded tokens and revokes the affected family.

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod refresh;
pub mod storage;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::RotationError;
pub use refresh::{IssuedCredentials, RotationPolicy, TokenRotationAuthority};

pub mod authority;
pub mod generator;
pub mod record;

pub use authority::{IssuedCredentials, RotationPolicy, TokenRotationAuthority};
pub use generator::RefreshTokenGenerator;
pub use record::{FamilyId, RefreshTokenRecord, RevocationReason, TokenId, TokenState, UserId};

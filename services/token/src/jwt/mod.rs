pub mod claims;
pub mod issuer;

pub use claims::Claims;
pub use issuer::{AccessTokenIssuer, AccessTokenRequest, JwtAccessTokenIssuer};

use crate::refresh::record::TokenId;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Separator between token id and secret in the presented form.
pub const PRESENTED_SEPARATOR: char = '.';

/// Length of a base64url-encoded 32-byte secret.
pub const SECRET_LEN: usize = 43;

pub struct RefreshTokenGenerator;

impl RefreshTokenGenerator {
    pub fn generate_secret() -> Zeroizing<String> {
        let mut random_bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut random_bytes[..]);
        Zeroizing::new(URL_SAFE_NO_PAD.encode(&random_bytes[..]))
    }

    pub fn hash(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let result = hasher.finalize();
        URL_SAFE_NO_PAD.encode(result)
    }

    /// Constant-time comparison of a presented secret against a stored hash.
    pub fn verify(secret: &str, expected_hash: &str) -> bool {
        let actual = Self::hash(secret);
        actual.as_bytes().ct_eq(expected_hash.as_bytes()).into()
    }

    /// Opaque string handed to the client.
    pub fn compose(id: &TokenId, secret: &str) -> String {
        format!("{}{}{}", id, PRESENTED_SEPARATOR, secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_secrets() {
        let secret1 = RefreshTokenGenerator::generate_secret();
        let secret2 = RefreshTokenGenerator::generate_secret();
        assert_ne!(*secret1, *secret2);
        assert_eq!(secret1.len(), SECRET_LEN);
    }

    #[test]
    fn test_hash_deterministic() {
        let hash1 = RefreshTokenGenerator::hash("test-secret");
        let hash2 = RefreshTokenGenerator::hash("test-secret");
        assert_eq!(hash1, hash2);
        assert_ne!(hash1, RefreshTokenGenerator::hash("other-secret"));
    }

    #[test]
    fn test_verify() {
        let secret = RefreshTokenGenerator::generate_secret();
        let hash = RefreshTokenGenerator::hash(&secret);

        assert!(RefreshTokenGenerator::verify(&secret, &hash));
        assert!(!RefreshTokenGenerator::verify("wrong", &hash));
        assert!(!RefreshTokenGenerator::verify(&secret, ""));
    }

    #[test]
    fn test_compose() {
        let id = TokenId::from("5f1c9a7e-0000-4000-8000-000000000001");
        let presented = RefreshTokenGenerator::compose(&id, "abc");
        assert_eq!(presented, "5f1c9a7e-0000-4000-8000-000000000001.abc");
    }
}

//! Random tokens and PKCE (RFC 7636) helpers.

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// `len` random bytes, base64url without padding.
pub fn random_token(len: usize) -> AppResult<String> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf)
        .map_err(|e| AppError::internal("rng_unavailable".to_string(), e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// 32 random bytes give a 43 character verifier, the RFC minimum.
pub fn generate_verifier() -> AppResult<String> {
    random_token(32)
}

/// `BASE64URL(SHA256(verifier))`, the `S256` challenge method.
pub fn challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(challenge_s256(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn verifier_shape() {
        let v = generate_verifier().unwrap();
        assert_eq!(v.len(), 43);
        assert!(v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(v, generate_verifier().unwrap());
    }
}

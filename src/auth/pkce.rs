//! PKCE (Proof Key for Code Exchange) and state generation for OAuth2
//!
//! Implements the S256 method of RFC 7636.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

/// Length of the code verifier (must be 43-128 characters)
const CODE_VERIFIER_LENGTH: usize = 64;

/// Random bytes behind the `state` parameter (256 bits)
const STATE_BYTES: usize = 32;

/// Characters allowed in code verifier (unreserved URI characters per RFC 7636)
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Generate a cryptographically random code verifier
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_VERIFIER_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..VERIFIER_CHARSET.len());
            VERIFIER_CHARSET[idx] as char
        })
        .collect()
}

/// Generate a code challenge from the code verifier
///
/// Uses S256 method: BASE64URL(SHA256(code_verifier))
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random `state` value for CSRF protection
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE pair containing both verifier and challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a new PKCE pair
    pub fn new() -> Self {
        Self::from_verifier(generate_code_verifier())
    }

    /// Build a pair around a known verifier
    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let challenge = generate_code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn method(&self) -> &'static str {
        "S256"
    }
}

impl Default for PkcePair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_verifier_length() {
        let verifier = generate_code_verifier();
        assert!(verifier.len() >= 43 && verifier.len() <= 128);
        assert_eq!(verifier.len(), CODE_VERIFIER_LENGTH);
    }

    #[test]
    fn test_code_verifier_characters() {
        let verifier = generate_code_verifier();
        for c in verifier.bytes() {
            assert!(VERIFIER_CHARSET.contains(&c), "Invalid character in verifier: {}", c as char);
        }
    }

    #[test]
    fn test_code_challenge_format() {
        let challenge = generate_code_challenge(&generate_code_verifier());

        // SHA256 produces 32 bytes, Base64URL encoding produces 43 characters (no padding)
        assert_eq!(challenge.len(), 43);
        assert!(challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_rfc7636_vector() {
        // Appendix B of RFC 7636
        let pair = PkcePair::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(pair.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert_eq!(pair.method(), "S256");
    }

    #[test]
    fn test_state_is_256_bits_base64url() {
        let state = generate_state();
        assert_eq!(state.len(), 43);
        assert_eq!(URL_SAFE_NO_PAD.decode(&state).unwrap().len(), STATE_BYTES);
    }

    #[test]
    fn test_values_are_unique() {
        assert_ne!(generate_code_verifier(), generate_code_verifier());
        assert_ne!(generate_state(), generate_state());
    }
}

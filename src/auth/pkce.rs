//! PKCE (Proof Key for Code Exchange) material and the CSRF state token
//!
//! Both values come from the thread-local CSPRNG and are generated once per
//! login attempt.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Verifier entropy in bytes (32 bytes → 43 base64url characters)
const VERIFIER_BYTES: usize = 32;

/// State entropy in bytes
const STATE_BYTES: usize = 32;

/// Challenge method sent with the authorization request
pub const CHALLENGE_METHOD: &str = "S256";

/// PKCE verifier/challenge pair
#[derive(Clone)]
pub struct PkcePair {
    /// Code verifier, sent only to the token endpoint
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`, sent with the authorization request
    pub challenge: String,
    /// Always `S256`
    pub method: &'static str,
}

impl fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .field("method", &self.method)
            .finish()
    }
}

impl PkcePair {
    /// Generate a fresh pair
    #[must_use]
    pub fn generate() -> Self {
        let verifier = URL_SAFE_NO_PAD.encode(random_bytes::<VERIFIER_BYTES>());
        let challenge = Self::challenge_for(&verifier);

        Self {
            verifier,
            challenge,
            method: CHALLENGE_METHOD,
        }
    }

    /// Compute the S256 challenge for a verifier
    #[must_use]
    pub fn challenge_for(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Check that a challenge was derived from a verifier
    #[must_use]
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        is_valid_verifier(verifier) && constant_time_eq(&Self::challenge_for(verifier), challenge)
    }
}

/// Whether a verifier satisfies RFC 7636 section 4.1 (length and charset)
#[must_use]
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Unguessable CSRF token echoed back by the provider on redirect
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationState(String);

impl fmt::Debug for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthorizationState(<redacted>)")
    }
}

impl AuthorizationState {
    /// Generate a new random state
    #[must_use]
    pub fn generate() -> Self {
        Self(URL_SAFE_NO_PAD.encode(random_bytes::<STATE_BYTES>()))
    }

    /// The value placed in the authorization URL
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against the `state` received on the callback
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(&self.0, candidate)
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

//! PKCE (RFC 7636) and random protocol values

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a PKCE verifier and its S256 challenge
pub fn generate_pkce() -> (String, String) {
    // 32 random bytes -> 43 base64url characters
    let verifier = random_token();
    let challenge = s256_challenge(&verifier);
    (verifier, challenge)
}

/// S256 challenge for a verifier
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Check a client's verifier against the challenge recorded at `/authorize`
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    // RFC 7636 §4.1: 43..=128 unreserved characters
    let well_formed = (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
    well_formed
        && s256_challenge(verifier)
            .as_bytes()
            .ct_eq(challenge.as_bytes())
            .into()
}

/// 256 bits of randomness, base64url encoded
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_verifier_is_base64url_safe() {
        for _ in 0..10 {
            let (verifier, challenge) = generate_pkce();
            assert_eq!(verifier.len(), 43);
            assert!(!verifier.contains(['+', '/', '=']));
            assert!(!challenge.contains(['+', '/', '=']));
            assert_ne!(verifier, challenge);
        }
    }

    #[test]
    fn rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            s256_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert!(verify_s256(verifier, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"));
    }

    #[test]
    fn verify_rejects_wrong_verifier() {
        let (_, challenge) = generate_pkce();
        let (other, _) = generate_pkce();
        assert!(!verify_s256(&other, &challenge));
    }

    #[test]
    fn verify_rejects_short_verifier() {
        let verifier = "too-short";
        assert!(!verify_s256(verifier, &s256_challenge(verifier)));
    }

    #[test]
    fn random_tokens_differ() {
        assert_ne!(random_token(), random_token());
    }
}

//! Cryptographic utilities (random credentials, secret hashing, PKCE) using `ring`.

use std::num::NonZeroU32;
use ring::{digest, pbkdf2};
use ring::rand::{SecureRandom, SystemRandom};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use subtle::ConstantTimeEq;
use super::error::OAuthError;

/// Bytes of entropy in authorization codes, refresh tokens and consent tickets.
pub const CREDENTIAL_BYTES: usize = 32;

const SECRET_SCHEME: &str = "pbkdf2-sha256";
const SECRET_SALT_BYTES: usize = 16;
const SECRET_HASH_BYTES: usize = digest::SHA256_OUTPUT_LEN;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Generate a random base64url (no padding) string carrying `bytes` bytes of entropy.
pub fn random_token(bytes: usize) -> Result<String, OAuthError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; bytes];
    rng.fill(&mut buf)?;
    Ok(URL_SAFE_NO_PAD.encode(&buf))
}

/// Generate a fresh high-entropy credential (256 bits).
pub fn new_credential() -> Result<String, OAuthError> {
    random_token(CREDENTIAL_BYTES)
}

/// Compare two byte strings in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Generate a PKCE code challenge from the given verifier using SHA-256 and base64url (no padding).
pub fn pkce_code_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Check an S256 code verifier against the challenge bound at authorization time.
pub fn verify_pkce(verifier: &str, challenge: &str) -> bool {
    // RFC 7636 section 4.1: 43..=128 unreserved characters.
    let well_formed = (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
    well_formed && constant_time_eq(pkce_code_challenge(verifier).as_bytes(), challenge.as_bytes())
}

/// Hash a client secret for storage.
///
/// The encoded form is `pbkdf2-sha256$<iterations>$<salt>$<hash>`.
pub fn hash_secret(secret: &str) -> Result<String, OAuthError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SECRET_SALT_BYTES];
    rng.fill(&mut salt)?;
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
        .ok_or_else(|| OAuthError::signing("invalid iteration count"))?;
    let mut hash = [0u8; SECRET_HASH_BYTES];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, &salt, secret.as_bytes(), &mut hash);
    Ok(format!(
        "{}${}${}${}",
        SECRET_SCHEME,
        PBKDF2_ITERATIONS,
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(hash)
    ))
}

/// Verify a presented secret against an encoded hash from [`hash_secret`].
///
/// Malformed hashes never verify.
pub fn verify_secret(secret: &str, encoded: &str) -> bool {
    let mut parts = encoded.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) =
        (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != SECRET_SCHEME {
        return false;
    }
    let Some(iterations) = iterations.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (URL_SAFE_NO_PAD.decode(salt), URL_SAFE_NO_PAD.decode(hash)) else {
        return false;
    };
    pbkdf2::verify(pbkdf2::PBKDF2_HMAC_SHA256, iterations, &salt, secret.as_bytes(), &hash).is_ok()
}

/// RFC 7638 thumbprint of an Ed25519 public key, used as the JWK `kid`.
pub fn ed25519_thumbprint(x: &str) -> String {
    // Members in lexicographic order, no whitespace.
    let canonical = format!(r#"{{"crv":"Ed25519","kty":"OKP","x":"{}"}}"#, x);
    let hash = digest::digest(&digest::SHA256, canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_unique_and_long_enough() {
        let a = new_credential().unwrap();
        let b = new_credential().unwrap();
        assert_ne!(a, b);
        // 32 bytes -> 43 base64url characters
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn secret_hash_verifies_only_the_original() {
        let encoded = hash_secret("s3cret").unwrap();
        assert!(encoded.starts_with("pbkdf2-sha256$"));
        assert!(verify_secret("s3cret", &encoded));
        assert!(!verify_secret("s3cret ", &encoded));
        assert!(!verify_secret("s3cret", "plain-text-secret"));
        assert!(!verify_secret("s3cret", "pbkdf2-sha256$0$AA$AA"));
    }

    #[test]
    fn pkce_rfc7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert_eq!(pkce_code_challenge(verifier), challenge);
        assert!(verify_pkce(verifier, challenge));
        assert!(!verify_pkce("short", challenge));
    }
}

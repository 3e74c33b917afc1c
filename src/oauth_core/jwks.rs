//! Signing key management and JWK Set publication.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use super::clock::Clock;
use super::crypto::ed25519_thumbprint;
use super::error::OAuthError;

/// A public key as published in a JWK Set (RFC 7517 / RFC 8037).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
}

/// The published verification keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    /// Builds a verification key from the published entry for `kid`.
    pub fn decoding_key(&self, kid: &str) -> Result<DecodingKey, OAuthError> {
        let jwk = self.find(kid).ok_or(OAuthError::InvalidGrant)?;
        if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
            return Err(OAuthError::InvalidGrant);
        }
        DecodingKey::from_ed_components(&jwk.x).map_err(|_| OAuthError::InvalidGrant)
    }

    pub fn kids(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.kid.as_str()).collect()
    }
}

const NO_EXPIRY: i64 = i64::MIN;

/// An Ed25519 signing key together with its public half.
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Jwk,
    created_at: DateTime<Utc>,
    // Unix seconds of the latest `exp` signed with this key.
    latest_expiry: AtomicI64,
}

impl SigningKey {
    /// Generates a fresh key pair.
    pub fn generate(now: DateTime<Utc>) -> Result<Self, OAuthError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)?;
        Self::from_pkcs8(pkcs8.as_ref(), now)
    }

    /// Imports a PKCS#8 (v1 or v2) Ed25519 private key in DER form.
    pub fn from_pkcs8(pkcs8: &[u8], now: DateTime<Utc>) -> Result<Self, OAuthError> {
        let pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)
            .map_err(|e| OAuthError::signing(format!("rejected Ed25519 key: {}", e)))?;
        let public = pair.public_key().as_ref();
        let x = URL_SAFE_NO_PAD.encode(public);
        let kid = ed25519_thumbprint(&x);
        let jwk = Jwk {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            x,
            kid: kid.clone(),
            use_: "sig".into(),
            alg: "EdDSA".into(),
        };
        Ok(Self {
            kid,
            encoding: EncodingKey::from_ed_der(pkcs8),
            decoding: DecodingKey::from_ed_der(public),
            jwk,
            created_at: now,
            latest_expiry: AtomicI64::new(NO_EXPIRY),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Expiry of the longest-lived token signed with this key.
    pub fn latest_expiry(&self) -> Option<DateTime<Utc>> {
        match self.latest_expiry.load(Ordering::Acquire) {
            NO_EXPIRY => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    fn note_expiry(&self, expires_at: DateTime<Utc>) {
        self.latest_expiry.fetch_max(expires_at.timestamp(), Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("created_at", &self.created_at)
            .field("latest_expiry", &self.latest_expiry())
            .finish()
    }
}

struct RetiredKey {
    key: Arc<SigningKey>,
    retired_at: DateTime<Utc>,
}

struct KeyRing {
    current: Arc<SigningKey>,
    retired: Vec<RetiredKey>,
}

/// Holds the active signing key and every retired key that may still have
/// live tokens.
///
/// A retired key stays in the published set until the clock passes the
/// expiry of the last token it signed; only then does [`KeyManager::prune`]
/// drop it.
pub struct KeyManager {
    ring: RwLock<KeyRing>,
    clock: Arc<dyn Clock>,
}

impl KeyManager {
    /// A manager with a freshly generated key.
    pub fn generate(clock: Arc<dyn Clock>) -> Result<Self, OAuthError> {
        let key = SigningKey::generate(clock.now())?;
        Ok(Self::with_key(key, clock))
    }

    /// A manager starting from an existing key.
    pub fn with_key(key: SigningKey, clock: Arc<dyn Clock>) -> Self {
        info!(kid = key.kid(), "signing key loaded");
        Self {
            ring: RwLock::new(KeyRing { current: Arc::new(key), retired: Vec::new() }),
            clock,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KeyRing>, OAuthError> {
        self.ring.read().map_err(|_| OAuthError::signing("key ring lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KeyRing>, OAuthError> {
        self.ring.write().map_err(|_| OAuthError::signing("key ring lock poisoned"))
    }

    /// The key new tokens are signed with.
    pub fn current_signing_key(&self) -> Result<Arc<SigningKey>, OAuthError> {
        Ok(self.read()?.current.clone())
    }

    /// Returns the current key after recording that it will sign a token
    /// valid until `expires_at`.
    ///
    /// The expiry is noted under the ring lock, so a concurrent rotation or
    /// prune always observes it.
    pub(crate) fn signing_key_for(&self, expires_at: DateTime<Utc>) -> Result<Arc<SigningKey>, OAuthError> {
        let ring = self.read()?;
        ring.current.note_expiry(expires_at);
        Ok(ring.current.clone())
    }

    /// Public keys of the current and every unpruned retired key.
    pub fn public_key_set(&self) -> Result<JwkSet, OAuthError> {
        let ring = self.read()?;
        let mut keys = vec![ring.current.jwk().clone()];
        keys.extend(ring.retired.iter().map(|r| r.key.jwk().clone()));
        Ok(JwkSet { keys })
    }

    /// Verification key for `kid`, if still published.
    pub fn decoding_key(&self, kid: &str) -> Result<Option<DecodingKey>, OAuthError> {
        let ring = self.read()?;
        if ring.current.kid() == kid {
            return Ok(Some(ring.current.decoding_key().clone()));
        }
        Ok(ring
            .retired
            .iter()
            .find(|r| r.key.kid() == kid)
            .map(|r| r.key.decoding_key().clone()))
    }

    /// Replaces the current key with a freshly generated one. Returns the new kid.
    pub fn rotate(&self) -> Result<String, OAuthError> {
        let key = SigningKey::generate(self.clock.now())?;
        self.rotate_to(key)
    }

    /// Replaces the current key with `key`. The old key is retired, not removed.
    #[instrument(skip(self, key), fields(new_kid = key.kid()), level = "debug")]
    pub fn rotate_to(&self, key: SigningKey) -> Result<String, OAuthError> {
        let now = self.clock.now();
        let kid = key.kid().to_string();
        let mut ring = self.write()?;
        let previous = std::mem::replace(&mut ring.current, Arc::new(key));
        info!(retired_kid = previous.kid(), new_kid = %kid, "signing key rotated");
        ring.retired.push(RetiredKey { key: previous, retired_at: now });
        Ok(kid)
    }

    /// Drops retired keys whose every token has expired. Returns their kids.
    pub fn prune(&self) -> Result<Vec<String>, OAuthError> {
        let now = self.clock.now();
        let mut ring = self.write()?;
        let mut pruned = Vec::new();
        ring.retired.retain(|retired| {
            let live = retired.key.latest_expiry().is_some_and(|exp| now < exp);
            if !live {
                info!(
                    kid = retired.key.kid(),
                    retired_for_secs = (now - retired.retired_at).num_seconds(),
                    "retired signing key pruned"
                );
                pruned.push(retired.key.kid().to_string());
            }
            live
        });
        Ok(pruned)
    }
}

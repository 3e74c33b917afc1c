//! Signed access tokens and opaque refresh tokens.

use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;
use super::clock::Clock;
use super::crypto;
use super::error::OAuthError;
use super::jwks::{JwkSet, KeyManager};
use super::types::{RefreshTokenRecord, ScopeSet};

/// Claims carried by every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Resource owner.
    pub sub: String,
    /// The client the token was issued to.
    pub aud: String,
    pub client_id: String,
    /// Granted scopes, space-delimited.
    pub scope: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique token id, the key for revocation.
    pub jti: String,
}

impl AccessTokenClaims {
    pub fn scopes(&self) -> ScopeSet {
        ScopeSet::parse(&self.scope).unwrap_or_default()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// A freshly signed access token.
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
    /// Lifetime in whole seconds.
    pub expires_in: u64,
    pub scopes: ScopeSet,
}

/// Mints access tokens (EdDSA JWTs) and refresh tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    issuer: String,
}

impl TokenIssuer {
    pub fn new(keys: Arc<KeyManager>, clock: Arc<dyn Clock>, issuer: impl Into<String>) -> Self {
        Self { keys, clock, issuer: issuer.into() }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Issues an access token valid for `ttl` from now.
    pub fn issue_access_token(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &ScopeSet,
        ttl: Duration,
    ) -> Result<IssuedAccessToken, OAuthError> {
        let now = self.clock.now();
        self.mint_access_token(&new_token_id(), subject, client_id, scopes, now, now + ttl)
    }

    /// Signs an access token with a caller-chosen id and validity window.
    #[instrument(skip(self, token_id, subject, scopes), level = "debug")]
    pub(crate) fn mint_access_token(
        &self,
        token_id: &str,
        subject: &str,
        client_id: &str,
        scopes: &ScopeSet,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<IssuedAccessToken, OAuthError> {
        let key = self.keys.signing_key_for(expires_at)?;
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: client_id.to_string(),
            client_id: client_id.to_string(),
            scope: scopes.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: token_id.to_string(),
        };
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(key.kid().to_string());
        let token = encode(&header, &claims, key.encoding_key())?;
        debug!(kid = key.kid(), "access token signed");
        Ok(IssuedAccessToken {
            token,
            token_id: token_id.to_string(),
            expires_at,
            expires_in: (expires_at - issued_at).num_seconds().max(0) as u64,
            scopes: scopes.clone(),
        })
    }

    /// Issues an opaque refresh token. A new rotation family is started
    /// unless `family_id` is given.
    pub fn issue_refresh_token(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &ScopeSet,
        ttl: Duration,
        family_id: Option<&str>,
    ) -> Result<RefreshTokenRecord, OAuthError> {
        let now = self.clock.now();
        Ok(RefreshTokenRecord {
            token: crypto::new_credential()?,
            client_id: client_id.to_string(),
            subject: subject.to_string(),
            scopes: scopes.clone(),
            family_id: family_id.map(str::to_string).unwrap_or_else(new_family_id),
            issued_at: now,
            expires_at: now + ttl,
        })
    }

    /// Verifies signature, issuer, audience and expiry of an access token.
    ///
    /// Revocation is not checked here; see
    /// [`AuthorizationServer::verify_access_token`](super::grant::AuthorizationServer::verify_access_token).
    pub fn verify_access_token(&self, token: &str, audience: Option<&str>) -> Result<AccessTokenClaims, OAuthError> {
        let kid = token_kid(token)?;
        let key = self.keys.decoding_key(&kid)?.ok_or(OAuthError::InvalidGrant)?;
        verify_with_key(token, &key, &self.issuer, audience, self.clock.now())
    }
}

/// Verifies an access token using only a published JWK Set.
pub fn verify_with_key_set(
    key_set: &JwkSet,
    token: &str,
    issuer: &str,
    audience: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AccessTokenClaims, OAuthError> {
    let kid = token_kid(token)?;
    let key = key_set.decoding_key(&kid)?;
    verify_with_key(token, &key, issuer, audience, now)
}

fn token_kid(token: &str) -> Result<String, OAuthError> {
    let header = decode_header(token).map_err(|_| OAuthError::InvalidGrant)?;
    if header.alg != Algorithm::EdDSA {
        return Err(OAuthError::InvalidGrant);
    }
    header.kid.ok_or(OAuthError::InvalidGrant)
}

fn verify_with_key(
    token: &str,
    key: &DecodingKey,
    issuer: &str,
    audience: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AccessTokenClaims, OAuthError> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    // Expiry is checked against the injected clock below.
    validation.validate_exp = false;
    validation.set_issuer(&[issuer]);
    match audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }
    let data = decode::<AccessTokenClaims>(token, key, &validation).map_err(|_| OAuthError::InvalidGrant)?;
    if now.timestamp() >= data.claims.exp {
        return Err(OAuthError::InvalidGrant);
    }
    Ok(data.claims)
}

pub(crate) fn new_token_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn new_family_id() -> String {
    Uuid::new_v4().to_string()
}

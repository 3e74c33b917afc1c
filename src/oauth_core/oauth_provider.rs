//! Storage traits consumed by the authorization core.
//!
//! Every trait is object safe so backends can be swapped behind an `Arc<dyn _>`.
//! Implementations must make the check-and-invalidate operations
//! ([`CodeStore::take_once`], [`RefreshTokenStore::take`]) atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use super::error::OAuthError;
use super::types::{
    AuthorizationCode, ConsentRecord, IssuedTokenIds, RefreshTokenRecord, RegisteredClient, ScopeSet,
};

/// Trait for retrieving OAuth2 clients.
#[async_trait]
pub trait ClientStore: Send + Sync + 'static {
    /// Retrieves a client by its identifier; `Ok(None)` when unknown.
    async fn get_client(&self, client_id: &str) -> Result<Option<RegisteredClient>, OAuthError>;
}

/// Outcome of [`CodeStore::take_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeRedemption {
    /// The code was valid and is now consumed.
    Redeemed(AuthorizationCode),
    /// No such code.
    NotFound,
    /// The code outlived its TTL. It is removed.
    Expired,
    /// The client or redirect URI differs from the one the code is bound to.
    /// The code is left untouched.
    Mismatch,
    /// The code was already consumed. Carries the ids of the tokens minted by
    /// the first redemption.
    Replayed(IssuedTokenIds),
}

/// Short-lived, single-use storage for authorization codes.
#[async_trait]
pub trait CodeStore: Send + Sync + 'static {
    /// Stores a new code. The entry lives until `code.expires_at`.
    async fn put(&self, code: AuthorizationCode) -> Result<(), OAuthError>;

    /// Atomically consumes a code bound to `client_id` and `redirect_uri`.
    ///
    /// On success `issued` is recorded against the consumed code so that a
    /// later replay reports which tokens to revoke. Of any number of concurrent
    /// calls for the same code at most one returns [`CodeRedemption::Redeemed`].
    async fn take_once(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        issued: IssuedTokenIds,
        now: DateTime<Utc>,
    ) -> Result<CodeRedemption, OAuthError>;

    /// Drops expired codes and stale replay records. Returns the number removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, OAuthError>;
}

/// Outcome of a refresh token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshLookup {
    /// The token is live. For [`RefreshTokenStore::take`] it is now rotated away.
    Active(RefreshTokenRecord),
    /// No such token, or its family was revoked.
    NotFound,
    /// The token outlived its TTL.
    Expired,
    /// The token belongs to another client.
    Mismatch,
    /// The token was already rotated away; presenting it again signals theft.
    Rotated { family_id: String },
}

/// What [`RefreshTokenStore::revoke_family`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevokedFamily {
    /// Refresh tokens removed from the store.
    pub refresh_tokens: usize,
    /// Access tokens minted under the family, as `(jti, exp)`. The caller
    /// puts them on the revocation list.
    pub access_tokens: Vec<(String, DateTime<Utc>)>,
}

/// Storage for opaque refresh tokens and their rotation families.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync + 'static {
    /// Stores a refresh token. Fails with `InvalidGrant` when its family has
    /// been revoked.
    async fn put(&self, record: RefreshTokenRecord) -> Result<(), OAuthError>;

    /// Looks a token up without changing it.
    async fn find(
        &self,
        token: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshLookup, OAuthError>;

    /// Atomically marks a live token as rotated and returns it.
    async fn take(
        &self,
        token: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshLookup, OAuthError>;

    /// Remembers an access token minted under a family so that revoking the
    /// family reports it. Fails with `InvalidGrant` when the family has been
    /// revoked.
    async fn record_access_token(
        &self,
        family_id: &str,
        token_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), OAuthError>;

    /// Revokes every refresh token of a family, hands back the access tokens
    /// recorded against it and blocks the family from growing.
    async fn revoke_family(&self, family_id: &str, now: DateTime<Utc>) -> Result<RevokedFamily, OAuthError>;

    /// Drops expired tokens, access token records and stale family markers.
    /// Returns the number removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, OAuthError>;
}

/// Per (resource owner, client) consent storage.
#[async_trait]
pub trait ConsentStore: Send + Sync + 'static {
    async fn get(&self, subject: &str, client_id: &str) -> Result<Option<ConsentRecord>, OAuthError>;

    /// Unions `scopes` into the stored record, creating it when absent.
    ///
    /// Concurrent merges for the same key must not lose updates.
    async fn merge(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &ScopeSet,
        now: DateTime<Utc>,
    ) -> Result<ConsentRecord, OAuthError>;

    /// Deletes the record. Returns whether one existed.
    async fn remove(&self, subject: &str, client_id: &str) -> Result<bool, OAuthError>;
}

/// Out-of-band revocation records for access tokens, keyed by `jti`.
#[async_trait]
pub trait RevocationList: Send + Sync + 'static {
    /// Marks a token id revoked until `expires_at`, after which the token is
    /// dead anyway.
    async fn revoke(&self, token_id: &str, expires_at: DateTime<Utc>) -> Result<(), OAuthError>;

    async fn is_revoked(&self, token_id: &str) -> Result<bool, OAuthError>;

    /// Drops records whose tokens have expired. Returns the number removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, OAuthError>;
}

//! In-memory default implementations for the storage traits.
//!
//! All maps are `DashMap`s. Check-and-invalidate operations run while holding
//! the shard write lock of the affected key (`get_mut` / `entry`), which makes
//! them atomic with respect to every other operation on that key.

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use super::error::OAuthError;
use super::oauth_provider::{
    ClientStore, CodeRedemption, CodeStore, ConsentStore, RefreshLookup, RefreshTokenStore,
    RevocationList, RevokedFamily,
};
use super::types::{
    AuthorizationCode, ConsentRecord, IssuedTokenIds, RefreshTokenRecord, RegisteredClient, ScopeSet,
};

#[derive(Clone)]
pub struct InMemoryClientStore {
    clients: Arc<DashMap<String, RegisteredClient>>,
}

impl InMemoryClientStore {
    /// Creates a new in-memory client store with an initial set of clients.
    pub fn new(initial_clients: Vec<RegisteredClient>) -> Self {
        let map = DashMap::new();
        for client in initial_clients {
            map.insert(client.client_id.clone(), client);
        }
        Self { clients: Arc::new(map) }
    }

    /// Registers or replaces a client.
    pub fn insert(&self, client: RegisteredClient) {
        self.clients.insert(client.client_id.clone(), client);
    }
}

impl Default for InMemoryClientStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<RegisteredClient>, OAuthError> {
        Ok(self.clients.get(client_id).map(|entry| entry.value().clone()))
    }
}

#[derive(Debug, Clone)]
enum CodeEntry {
    Pending(AuthorizationCode),
    Consumed { issued: IssuedTokenIds, forget_at: DateTime<Utc> },
}

/// In-memory authorization code store.
///
/// Consumed codes stay behind as replay markers for `replay_window` (and at
/// least until the code would have expired) so that a second redemption can be
/// told apart from a guess.
#[derive(Clone)]
pub struct InMemoryCodeStore {
    codes: Arc<DashMap<String, CodeEntry>>,
    replay_window: Duration,
}

impl InMemoryCodeStore {
    /// Creates a store keeping replay markers for one hour.
    pub fn new() -> Self {
        Self::with_replay_window(Duration::hours(1))
    }

    pub fn with_replay_window(replay_window: Duration) -> Self {
        Self { codes: Arc::new(DashMap::new()), replay_window }
    }

    /// Number of entries, pending and consumed.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for InMemoryCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn put(&self, code: AuthorizationCode) -> Result<(), OAuthError> {
        self.codes.insert(code.code.clone(), CodeEntry::Pending(code));
        Ok(())
    }

    async fn take_once(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        issued: IssuedTokenIds,
        now: DateTime<Utc>,
    ) -> Result<CodeRedemption, OAuthError> {
        let Some(mut entry) = self.codes.get_mut(code) else {
            return Ok(CodeRedemption::NotFound);
        };
        let record = match entry.value() {
            CodeEntry::Consumed { issued, .. } => return Ok(CodeRedemption::Replayed(issued.clone())),
            CodeEntry::Pending(record) => record.clone(),
        };
        if record.is_expired_at(now) {
            // Release the shard lock before removing.
            drop(entry);
            self.codes
                .remove_if(code, |_, v| matches!(v, CodeEntry::Pending(r) if r.is_expired_at(now)));
            return Ok(CodeRedemption::Expired);
        }
        if record.client_id != client_id || record.redirect_uri != redirect_uri {
            return Ok(CodeRedemption::Mismatch);
        }
        let forget_at = std::cmp::max(record.expires_at, now + self.replay_window);
        *entry.value_mut() = CodeEntry::Consumed { issued, forget_at };
        Ok(CodeRedemption::Redeemed(record))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, OAuthError> {
        let mut removed = 0;
        self.codes.retain(|_, entry| {
            let keep = match entry {
                CodeEntry::Pending(record) => !record.is_expired_at(now),
                CodeEntry::Consumed { forget_at, .. } => now < *forget_at,
            };
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

#[derive(Debug, Clone)]
struct RefreshEntry {
    record: RefreshTokenRecord,
    rotated: bool,
}

/// In-memory refresh token store with rotation families.
#[derive(Clone)]
pub struct InMemoryRefreshTokenStore {
    tokens: Arc<DashMap<String, RefreshEntry>>,
    /// Access tokens minted per family, as `(jti, exp)`.
    family_access: Arc<DashMap<String, Vec<(String, DateTime<Utc>)>>>,
    revoked_families: Arc<DashMap<String, DateTime<Utc>>>,
    family_marker_ttl: Duration,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            family_access: Arc::new(DashMap::new()),
            revoked_families: Arc::new(DashMap::new()),
            family_marker_ttl: Duration::days(30),
        }
    }

    /// Number of stored tokens, live and rotated.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn lookup(entry: &RefreshEntry, client_id: &str, now: DateTime<Utc>) -> Option<RefreshLookup> {
        if entry.rotated {
            return Some(RefreshLookup::Rotated { family_id: entry.record.family_id.clone() });
        }
        if entry.record.is_expired_at(now) {
            return Some(RefreshLookup::Expired);
        }
        if entry.record.client_id != client_id {
            return Some(RefreshLookup::Mismatch);
        }
        None
    }
}

impl Default for InMemoryRefreshTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn put(&self, record: RefreshTokenRecord) -> Result<(), OAuthError> {
        if self.revoked_families.contains_key(&record.family_id) {
            return Err(OAuthError::InvalidGrant);
        }
        let token = record.token.clone();
        let family_id = record.family_id.clone();
        self.tokens.insert(token.clone(), RefreshEntry { record, rotated: false });
        // revoke_family marks before it scans, so one of the two sides always
        // sees the other.
        if self.revoked_families.contains_key(&family_id) {
            self.tokens.remove(&token);
            return Err(OAuthError::InvalidGrant);
        }
        Ok(())
    }

    async fn find(
        &self,
        token: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshLookup, OAuthError> {
        let Some(entry) = self.tokens.get(token) else {
            return Ok(RefreshLookup::NotFound);
        };
        Ok(Self::lookup(entry.value(), client_id, now)
            .unwrap_or_else(|| RefreshLookup::Active(entry.value().record.clone())))
    }

    async fn take(
        &self,
        token: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshLookup, OAuthError> {
        let Some(mut entry) = self.tokens.get_mut(token) else {
            return Ok(RefreshLookup::NotFound);
        };
        if let Some(outcome) = Self::lookup(entry.value(), client_id, now) {
            return Ok(outcome);
        }
        entry.value_mut().rotated = true;
        Ok(RefreshLookup::Active(entry.value().record.clone()))
    }

    async fn record_access_token(
        &self,
        family_id: &str,
        token_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), OAuthError> {
        if self.revoked_families.contains_key(family_id) {
            return Err(OAuthError::InvalidGrant);
        }
        self.family_access
            .entry(family_id.to_string())
            .or_default()
            .push((token_id.to_string(), expires_at));
        // Same ordering as `put`: a revocation that started before the push
        // either drained it or is visible here.
        if self.revoked_families.contains_key(family_id) {
            return Err(OAuthError::InvalidGrant);
        }
        Ok(())
    }

    async fn revoke_family(&self, family_id: &str, now: DateTime<Utc>) -> Result<RevokedFamily, OAuthError> {
        self.revoked_families.insert(family_id.to_string(), now + self.family_marker_ttl);
        let mut removed = 0;
        let mut latest_expiry = now;
        self.tokens.retain(|_, entry| {
            if entry.record.family_id != family_id {
                return true;
            }
            removed += 1;
            latest_expiry = std::cmp::max(latest_expiry, entry.record.expires_at);
            false
        });
        let access_tokens = self
            .family_access
            .remove(family_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        if let Some(mut marker) = self.revoked_families.get_mut(family_id) {
            if latest_expiry > *marker.value() {
                *marker.value_mut() = latest_expiry;
            }
        }
        Ok(RevokedFamily { refresh_tokens: removed, access_tokens })
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, OAuthError> {
        let mut removed = 0;
        self.tokens.retain(|_, entry| {
            let keep = !entry.record.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.family_access.retain(|_, ids| {
            let before = ids.len();
            ids.retain(|(_, expires_at)| now < *expires_at);
            removed += before - ids.len();
            !ids.is_empty()
        });
        self.revoked_families.retain(|_, forget_at| {
            let keep = now < *forget_at;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

/// In-memory consent store keyed by (subject, client id).
#[derive(Clone)]
pub struct InMemoryConsentStore {
    consents: Arc<DashMap<(String, String), ConsentRecord>>,
}

impl InMemoryConsentStore {
    /// Creates a new in-memory consent store.
    pub fn new() -> Self {
        Self { consents: Arc::new(DashMap::new()) }
    }
}

impl Default for InMemoryConsentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn get(&self, subject: &str, client_id: &str) -> Result<Option<ConsentRecord>, OAuthError> {
        let key = (subject.to_string(), client_id.to_string());
        Ok(self.consents.get(&key).map(|entry| entry.value().clone()))
    }

    async fn merge(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &ScopeSet,
        now: DateTime<Utc>,
    ) -> Result<ConsentRecord, OAuthError> {
        let key = (subject.to_string(), client_id.to_string());
        // The entry guard holds the shard lock across read-modify-write.
        let entry = self
            .consents
            .entry(key)
            .and_modify(|record| {
                record.scopes = record.scopes.union(scopes);
                record.updated_at = now;
            })
            .or_insert_with(|| ConsentRecord {
                subject: subject.to_string(),
                client_id: client_id.to_string(),
                scopes: scopes.clone(),
                granted_at: now,
                updated_at: now,
            });
        Ok(entry.value().clone())
    }

    async fn remove(&self, subject: &str, client_id: &str) -> Result<bool, OAuthError> {
        let key = (subject.to_string(), client_id.to_string());
        Ok(self.consents.remove(&key).is_some())
    }
}

/// In-memory revocation list for access token ids.
#[derive(Clone)]
pub struct InMemoryRevocationList {
    revoked: Arc<DashMap<String, DateTime<Utc>>>,
}

impl InMemoryRevocationList {
    pub fn new() -> Self {
        Self { revoked: Arc::new(DashMap::new()) }
    }
}

impl Default for InMemoryRevocationList {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn revoke(&self, token_id: &str, expires_at: DateTime<Utc>) -> Result<(), OAuthError> {
        self.revoked
            .entry(token_id.to_string())
            .and_modify(|existing| *existing = std::cmp::max(*existing, expires_at))
            .or_insert(expires_at);
        Ok(())
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, OAuthError> {
        Ok(self.revoked.contains_key(token_id))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, OAuthError> {
        let mut removed = 0;
        self.revoked.retain(|_, expires_at| {
            let keep = now < *expires_at;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

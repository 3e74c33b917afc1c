//! The authorization code grant state machine.
//!
//! A request moves `Requested -> AwaitingConsent -> CodeIssued -> Redeemed`,
//! or ends in `Rejected` / `Expired`. [`AuthorizationServer::authorize`]
//! covers the first three states, [`AuthorizationServer::decide_consent`]
//! resumes a suspended request, and [`AuthorizationServer::exchange`] redeems
//! codes and refresh tokens.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use super::bounded;
use super::clock::{Clock, SystemClock};
use super::config::AuthzConfig;
use super::consent::ConsentTracker;
use super::crypto;
use super::endpoint::append_query;
use super::error::{ConfigError, OAuthError};
use super::jwks::{JwkSet, KeyManager};
use super::jwt::{new_family_id, new_token_id, AccessTokenClaims, IssuedAccessToken, TokenIssuer};
use super::memory::{
    InMemoryClientStore, InMemoryCodeStore, InMemoryConsentStore, InMemoryRefreshTokenStore,
    InMemoryRevocationList,
};
use super::oauth_provider::{
    ClientStore, CodeRedemption, CodeStore, ConsentStore, RefreshLookup, RefreshTokenStore,
    RevocationList,
};
use super::registry::{ClientCredentials, ClientRegistry};
use super::types::{
    AuthorizationCode, GrantType, IssuedTokenIds, RefreshTokenRecord, RegisteredClient, ScopeSet,
    TokenResponse,
};

/// An authorize request from an authenticated resource owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// Raw `scope` parameter. Absent means the client's registered scopes.
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Resource owner, as established by the login boundary.
    pub subject: String,
}

impl AuthorizationRequest {
    /// A `response_type=code` request.
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            response_type: "code".into(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Attaches an S256 PKCE challenge.
    pub fn pkce_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.code_challenge = Some(challenge.into());
        self.code_challenge_method = Some("S256".into());
        self
    }
}

/// A successful authorize step: where to send the user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub redirect_uri: String,
    pub code: String,
    pub state: Option<String>,
    pub scopes: ScopeSet,
}

impl AuthorizationResponse {
    /// `redirect_uri` with `code` and `state` appended.
    pub fn redirect_url(&self) -> Result<String, OAuthError> {
        let mut params = vec![("code", self.code.as_str())];
        if let Some(state) = &self.state {
            params.push(("state", state.as_str()));
        }
        append_query(&self.redirect_uri, &params)
    }
}

/// A request suspended until the resource owner decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConsent {
    /// Opaque handle for [`AuthorizationServer::decide_consent`].
    pub ticket: String,
    pub client_id: String,
    pub subject: String,
    /// Every scope the client asked for.
    pub requested: ScopeSet,
    /// Scopes not covered by an earlier consent.
    pub missing: ScopeSet,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    ConsentRequired(PendingConsent),
    Issued(AuthorizationResponse),
}

/// Where an authorize error is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRedirect {
    pub redirect_uri: String,
    pub state: Option<String>,
}

/// A rejected authorize step.
///
/// `redirect` is only set once the redirect URI has been validated; errors
/// before that point must be shown to the user agent directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeError {
    pub error: OAuthError,
    pub redirect: Option<ErrorRedirect>,
}

impl AuthorizeError {
    fn direct(error: OAuthError) -> Self {
        Self { error, redirect: None }
    }

    fn redirect(error: OAuthError, redirect_uri: &str, state: Option<&str>) -> Self {
        Self {
            error,
            redirect: Some(ErrorRedirect {
                redirect_uri: redirect_uri.to_string(),
                state: state.map(str::to_string),
            }),
        }
    }

    /// Error redirect carrying `error`, `error_description` and `state`.
    pub fn redirect_url(&self) -> Option<String> {
        let target = self.redirect.as_ref()?;
        let description = self.error.error_description();
        let mut params = vec![("error", self.error.error_code()), ("error_description", description.as_str())];
        if let Some(state) = &target.state {
            params.push(("state", state.as_str()));
        }
        append_query(&target.redirect_uri, &params).ok()
    }
}

impl std::fmt::Display for AuthorizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for AuthorizeError {}

/// The resource owner's answer to a [`PendingConsent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    /// Approve `scopes` (a subset of the requested ones), or all requested
    /// scopes when `None`.
    Grant { scopes: Option<ScopeSet> },
    Deny,
}

/// A token endpoint request, after client credentials have been extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRequest {
    AuthorizationCode {
        code: String,
        redirect_uri: String,
        code_verifier: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
        scope: Option<String>,
    },
}

impl TokenRequest {
    pub fn grant_type(&self) -> GrantType {
        match self {
            TokenRequest::AuthorizationCode { .. } => GrantType::AuthorizationCode,
            TokenRequest::RefreshToken { .. } => GrantType::RefreshToken,
        }
    }
}

/// Entries removed by one [`AuthorizationServer::sweep_expired`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub codes: usize,
    pub refresh_tokens: usize,
    pub revocations: usize,
    pub pending_consents: usize,
    pub keys: usize,
    /// Filled in by [`Endpoints::sweep_expired`](super::endpoint::Endpoints::sweep_expired).
    pub rate_limit_buckets: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.codes
            + self.refresh_tokens
            + self.revocations
            + self.pending_consents
            + self.keys
            + self.rate_limit_buckets
    }
}

/// Authorization server metadata (RFC 8414).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub revocation_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

#[derive(Debug, Clone)]
struct SuspendedRequest {
    client_id: String,
    redirect_uri: String,
    requested: ScopeSet,
    state: Option<String>,
    nonce: Option<String>,
    code_challenge: Option<String>,
    subject: String,
    expires_at: DateTime<Utc>,
}

/// Builder for [`AuthorizationServer`]. Every collaborator defaults to its
/// in-memory implementation.
pub struct AuthorizationServerBuilder {
    config: AuthzConfig,
    clock: Arc<dyn Clock>,
    client_store: Arc<dyn ClientStore>,
    code_store: Option<Arc<dyn CodeStore>>,
    refresh_token_store: Arc<dyn RefreshTokenStore>,
    consent_store: Arc<dyn ConsentStore>,
    revocation_list: Arc<dyn RevocationList>,
    key_manager: Option<Arc<KeyManager>>,
}

impl AuthorizationServerBuilder {
    fn new() -> Self {
        Self {
            config: AuthzConfig::default(),
            clock: Arc::new(SystemClock),
            client_store: Arc::new(InMemoryClientStore::default()),
            code_store: None,
            refresh_token_store: Arc::new(InMemoryRefreshTokenStore::new()),
            consent_store: Arc::new(InMemoryConsentStore::new()),
            revocation_list: Arc::new(InMemoryRevocationList::new()),
            key_manager: None,
        }
    }

    pub fn config(mut self, config: AuthzConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets a custom client store.
    pub fn client_store(mut self, store: Arc<dyn ClientStore>) -> Self {
        self.client_store = store;
        self
    }

    /// Sets a custom code store. The default keeps replay markers for
    /// `code_replay_window_secs`.
    pub fn code_store(mut self, store: Arc<dyn CodeStore>) -> Self {
        self.code_store = Some(store);
        self
    }

    pub fn refresh_token_store(mut self, store: Arc<dyn RefreshTokenStore>) -> Self {
        self.refresh_token_store = store;
        self
    }

    pub fn consent_store(mut self, store: Arc<dyn ConsentStore>) -> Self {
        self.consent_store = store;
        self
    }

    pub fn revocation_list(mut self, list: Arc<dyn RevocationList>) -> Self {
        self.revocation_list = list;
        self
    }

    /// Uses existing signing keys instead of generating one at build time.
    pub fn key_manager(mut self, keys: Arc<KeyManager>) -> Self {
        self.key_manager = Some(keys);
        self
    }

    /// Validates the configuration and assembles the server.
    pub fn build(self) -> Result<AuthorizationServer, ConfigError> {
        self.config.validate()?;
        let keys = match self.key_manager {
            Some(keys) => keys,
            None => Arc::new(KeyManager::generate(self.clock.clone())?),
        };
        let timeout = self.config.storage_timeout();
        let code_store: Arc<dyn CodeStore> = match self.code_store {
            Some(store) => store,
            None => Arc::new(InMemoryCodeStore::with_replay_window(self.config.code_replay_window())),
        };
        info!(issuer = %self.config.issuer, "authorization server ready");
        Ok(AuthorizationServer {
            registry: ClientRegistry::new(self.client_store, self.config.allow_public_clients, timeout),
            consent: ConsentTracker::new(self.consent_store, timeout),
            issuer: TokenIssuer::new(keys.clone(), self.clock.clone(), self.config.issuer.clone()),
            codes: code_store,
            refresh_tokens: self.refresh_token_store,
            revocations: self.revocation_list,
            keys,
            clock: self.clock,
            suspended: DashMap::new(),
            config: self.config,
        })
    }
}

/// The authorization code + refresh token issuance core.
pub struct AuthorizationServer {
    config: AuthzConfig,
    clock: Arc<dyn Clock>,
    registry: ClientRegistry,
    consent: ConsentTracker,
    issuer: TokenIssuer,
    keys: Arc<KeyManager>,
    codes: Arc<dyn CodeStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    revocations: Arc<dyn RevocationList>,
    suspended: DashMap<String, SuspendedRequest>,
}

impl AuthorizationServer {
    pub fn builder() -> AuthorizationServerBuilder {
        AuthorizationServerBuilder::new()
    }

    pub fn config(&self) -> &AuthzConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn consent_tracker(&self) -> &ConsentTracker {
        &self.consent
    }

    pub fn token_issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// The JWK Set to publish.
    pub fn public_key_set(&self) -> Result<JwkSet, OAuthError> {
        self.keys.public_key_set()
    }

    /// Validates an authorize request and either issues a code or suspends
    /// the request for consent.
    #[instrument(skip(self, request), fields(client_id = %request.client_id), level = "debug")]
    pub async fn authorize(&self, request: AuthorizationRequest) -> Result<AuthorizeOutcome, AuthorizeError> {
        let result = self.authorize_request(&request).await;
        if let Err(rejected) = &result {
            warn!(
                client_id = %request.client_id,
                error_code = rejected.error.error_code(),
                redirected = rejected.redirect.is_some(),
                "authorize request rejected"
            );
        }
        result
    }

    async fn authorize_request(&self, request: &AuthorizationRequest) -> Result<AuthorizeOutcome, AuthorizeError> {
        if request.client_id.is_empty() {
            return Err(AuthorizeError::direct(OAuthError::invalid_request("client_id is required")));
        }
        let client = self
            .registry
            .resolve(&request.client_id)
            .await
            .map_err(|e| AuthorizeError::direct(e.or_on_timeout(OAuthError::AccessDenied)))?;
        if request.redirect_uri.is_empty() {
            return Err(AuthorizeError::direct(OAuthError::invalid_request("redirect_uri is required")));
        }
        if !client.has_redirect_uri(&request.redirect_uri) {
            return Err(AuthorizeError::direct(OAuthError::InvalidRedirectUri));
        }

        // The redirect URI is trusted from here on.
        let reject = |error: OAuthError| {
            AuthorizeError::redirect(
                error.or_on_timeout(OAuthError::AccessDenied),
                &request.redirect_uri,
                request.state.as_deref(),
            )
        };
        if request.response_type != "code" {
            return Err(reject(OAuthError::UnsupportedResponseType));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(reject(OAuthError::UnauthorizedClient));
        }
        if client.is_public() && !self.config.allow_public_clients {
            return Err(reject(OAuthError::UnauthorizedClient));
        }
        let requested = self.requested_scopes(&client, request.scope.as_deref()).map_err(reject)?;
        if request.subject.is_empty() {
            return Err(reject(OAuthError::invalid_request("resource owner is not authenticated")));
        }
        let code_challenge = Self::code_challenge(&client, request).map_err(reject)?;

        let validated = SuspendedRequest {
            client_id: client.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            requested: requested.clone(),
            state: request.state.clone(),
            nonce: request.nonce.clone(),
            code_challenge,
            subject: request.subject.clone(),
            expires_at: self.clock.now() + self.config.consent_ttl(),
        };
        if client.require_consent {
            let missing = self
                .consent
                .missing_scopes(&request.subject, &client.client_id, &requested)
                .await
                .map_err(reject)?;
            if !missing.is_empty() {
                let pending = self.suspend(validated, missing).map_err(reject)?;
                return Ok(AuthorizeOutcome::ConsentRequired(pending));
            }
        }
        self.issue_code(&validated, requested)
            .await
            .map(AuthorizeOutcome::Issued)
            .map_err(reject)
    }

    fn requested_scopes(&self, client: &RegisteredClient, raw: Option<&str>) -> Result<ScopeSet, OAuthError> {
        let requested = match raw {
            Some(raw) if !raw.trim().is_empty() => ScopeSet::parse(raw)?,
            _ => client.scopes.clone(),
        };
        if requested.is_empty() || !requested.is_subset(&client.scopes) {
            return Err(OAuthError::InvalidScope);
        }
        Ok(requested)
    }

    fn code_challenge(client: &RegisteredClient, request: &AuthorizationRequest) -> Result<Option<String>, OAuthError> {
        let Some(challenge) = request.code_challenge.as_deref().filter(|c| !c.is_empty()) else {
            if client.require_pkce || client.is_public() {
                return Err(OAuthError::invalid_request("code_challenge is required"));
            }
            return Ok(None);
        };
        if request.code_challenge_method.as_deref() != Some("S256") {
            return Err(OAuthError::invalid_request("code_challenge_method must be S256"));
        }
        let well_formed = challenge.len() == 43
            && challenge.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !well_formed {
            return Err(OAuthError::invalid_request("malformed code_challenge"));
        }
        Ok(Some(challenge.to_string()))
    }

    fn suspend(&self, request: SuspendedRequest, missing: ScopeSet) -> Result<PendingConsent, OAuthError> {
        let ticket = crypto::new_credential()?;
        debug!(client_id = %request.client_id, missing = %missing, "awaiting consent");
        let pending = PendingConsent {
            ticket: ticket.clone(),
            client_id: request.client_id.clone(),
            subject: request.subject.clone(),
            requested: request.requested.clone(),
            missing,
            expires_at: request.expires_at,
        };
        self.suspended.insert(ticket, request);
        Ok(pending)
    }

    /// Resumes a suspended authorize request with the owner's decision.
    ///
    /// A ticket is decided at most once. `subject` must be the owner the
    /// request was suspended for.
    #[instrument(skip(self, ticket, decision), level = "debug")]
    pub async fn decide_consent(
        &self,
        ticket: &str,
        subject: &str,
        decision: ConsentDecision,
    ) -> Result<AuthorizationResponse, AuthorizeError> {
        let Some((_, suspended)) = self.suspended.remove_if(ticket, |_, s| s.subject == subject) else {
            let error = if self.suspended.contains_key(ticket) {
                OAuthError::invalid_request("consent decision from a different resource owner")
            } else {
                OAuthError::invalid_request("unknown or already decided consent request")
            };
            warn!(error_code = error.error_code(), "consent decision rejected");
            return Err(AuthorizeError::direct(error));
        };
        let reject = |error: OAuthError| {
            warn!(client_id = %suspended.client_id, error_code = error.error_code(), "consent decision rejected");
            AuthorizeError::redirect(
                error.or_on_timeout(OAuthError::AccessDenied),
                &suspended.redirect_uri,
                suspended.state.as_deref(),
            )
        };
        if self.clock.now() >= suspended.expires_at {
            return Err(reject(OAuthError::AccessDenied));
        }
        let granted = match decision {
            ConsentDecision::Deny => {
                info!(client_id = %suspended.client_id, "resource owner denied consent");
                return Err(reject(OAuthError::AccessDenied));
            }
            ConsentDecision::Grant { scopes } => scopes.unwrap_or_else(|| suspended.requested.clone()),
        };
        if granted.is_empty() || !granted.is_subset(&suspended.requested) {
            return Err(reject(OAuthError::InvalidScope));
        }
        self.consent
            .record_consent(&suspended.subject, &suspended.client_id, &granted, self.clock.now())
            .await
            .map_err(reject)?;
        self.issue_code(&suspended, granted).await.map_err(reject)
    }

    async fn issue_code(&self, request: &SuspendedRequest, granted: ScopeSet) -> Result<AuthorizationResponse, OAuthError> {
        let now = self.clock.now();
        let code = AuthorizationCode {
            code: crypto::new_credential()?,
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scopes: granted.clone(),
            subject: request.subject.clone(),
            nonce: request.nonce.clone(),
            code_challenge: request.code_challenge.clone(),
            issued_at: now,
            expires_at: now + self.config.code_ttl(),
        };
        let value = code.code.clone();
        bounded(self.config.storage_timeout(), self.codes.put(code)).await?;
        info!(client_id = %request.client_id, scope = %granted, "authorization code issued");
        Ok(AuthorizationResponse {
            redirect_uri: request.redirect_uri.clone(),
            code: value,
            state: request.state.clone(),
            scopes: granted,
        })
    }

    /// Token endpoint: authenticates the client and redeems a code or a
    /// refresh token.
    #[instrument(skip(self, request, credentials), fields(client_id = %credentials.client_id, grant_type = %request.grant_type()), level = "debug")]
    pub async fn exchange(&self, request: TokenRequest, credentials: &ClientCredentials) -> Result<TokenResponse, OAuthError> {
        let result = self
            .exchange_grant(request, credentials)
            .await
            .map_err(|e| e.or_on_timeout(OAuthError::InvalidGrant));
        if let Err(error) = &result {
            warn!(client_id = %credentials.client_id, error_code = error.error_code(), "token request rejected");
        }
        result
    }

    async fn exchange_grant(&self, request: TokenRequest, credentials: &ClientCredentials) -> Result<TokenResponse, OAuthError> {
        let client = self.registry.authenticate(credentials).await?;
        match request {
            TokenRequest::AuthorizationCode { code, redirect_uri, code_verifier } => {
                self.redeem_code(&client, &code, &redirect_uri, code_verifier.as_deref()).await
            }
            TokenRequest::RefreshToken { refresh_token, scope } => {
                self.refresh(&client, &refresh_token, scope.as_deref()).await
            }
        }
    }

    async fn redeem_code(
        &self,
        client: &RegisteredClient,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, OAuthError> {
        if code.is_empty() {
            return Err(OAuthError::invalid_request("code is required"));
        }
        if redirect_uri.is_empty() {
            return Err(OAuthError::invalid_request("redirect_uri is required"));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(OAuthError::UnauthorizedClient);
        }
        let now = self.clock.now();
        // Token ids are fixed before the code is consumed so a replay racing
        // this redemption can always revoke them.
        let issued = IssuedTokenIds {
            access_token_id: new_token_id(),
            access_expires_at: now + client.access_token_ttl,
            refresh_family: client.refresh_eligible().then(new_family_id),
        };
        let redemption = bounded(
            self.config.storage_timeout(),
            self.codes.take_once(code, &client.client_id, redirect_uri, issued.clone(), now),
        )
        .await?;
        let record = match redemption {
            CodeRedemption::Redeemed(record) => record,
            CodeRedemption::Replayed(previous) => {
                let revoked = self.revoke_issued(&previous).await;
                warn!(client_id = %client.client_id, revoked_tokens = revoked, "authorization code replayed");
                return Err(OAuthError::InvalidGrant);
            }
            CodeRedemption::NotFound | CodeRedemption::Expired | CodeRedemption::Mismatch => {
                return Err(OAuthError::InvalidGrant);
            }
        };
        match self.mint_for_code(client, &record, &issued, code_verifier, now).await {
            Ok(response) => Ok(response),
            Err(error) => {
                // The code is spent; nothing minted for it may stay usable.
                self.revoke_issued(&issued).await;
                Err(error)
            }
        }
    }

    async fn mint_for_code(
        &self,
        client: &RegisteredClient,
        record: &AuthorizationCode,
        issued: &IssuedTokenIds,
        code_verifier: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, OAuthError> {
        match (&record.code_challenge, code_verifier) {
            (Some(challenge), Some(verifier)) if crypto::verify_pkce(verifier, challenge) => {}
            (None, None) if !client.is_public() => {}
            _ => return Err(OAuthError::InvalidGrant),
        }
        let access = self.issuer.mint_access_token(
            &issued.access_token_id,
            &record.subject,
            &client.client_id,
            &record.scopes,
            now,
            issued.access_expires_at,
        )?;
        let refresh_token = match &issued.refresh_family {
            Some(family) => {
                let refresh = self.issuer.issue_refresh_token(
                    &record.subject,
                    &client.client_id,
                    &record.scopes,
                    client.refresh_token_ttl,
                    Some(family),
                )?;
                let token = refresh.token.clone();
                self.store_refresh_token(refresh).await?;
                self.track_access_token(family, &access).await?;
                Some(token)
            }
            None => None,
        };
        info!(
            client_id = %client.client_id,
            scope = %record.scopes,
            refresh = refresh_token.is_some(),
            "tokens issued for authorization code"
        );
        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".into(),
            expires_in: access.expires_in,
            scope: access.scopes.to_string(),
            refresh_token,
        })
    }

    /// Revokes everything minted from one code. Returns how many tokens were hit.
    async fn revoke_issued(&self, issued: &IssuedTokenIds) -> usize {
        let timeout = self.config.storage_timeout();
        let mut revoked = 0;
        match bounded(timeout, self.revocations.revoke(&issued.access_token_id, issued.access_expires_at)).await {
            Ok(()) => revoked += 1,
            Err(error) => warn!(error = %error, "access token revocation failed"),
        }
        if let Some(family) = &issued.refresh_family {
            match self.revoke_family(family).await {
                Ok(count) => revoked += count,
                Err(error) => warn!(error = %error, "refresh family revocation failed"),
            }
        }
        revoked
    }

    /// Revokes a refresh family together with every access token minted
    /// under it. Returns how many tokens were hit.
    async fn revoke_family(&self, family_id: &str) -> Result<usize, OAuthError> {
        let timeout = self.config.storage_timeout();
        let revoked = bounded(timeout, self.refresh_tokens.revoke_family(family_id, self.clock.now())).await?;
        for (token_id, expires_at) in &revoked.access_tokens {
            bounded(timeout, self.revocations.revoke(token_id, *expires_at)).await?;
        }
        Ok(revoked.refresh_tokens + revoked.access_tokens.len())
    }

    /// Ties a freshly minted access token to its refresh family.
    ///
    /// If the family was revoked in the meantime the token is revoked on the
    /// spot, the same way a dropped refresh token is never stored.
    async fn track_access_token(&self, family_id: &str, access: &IssuedAccessToken) -> Result<(), OAuthError> {
        let timeout = self.config.storage_timeout();
        let recorded = bounded(
            timeout,
            self.refresh_tokens.record_access_token(family_id, &access.token_id, access.expires_at),
        )
        .await;
        match recorded {
            Err(OAuthError::InvalidGrant) => {
                warn!("refresh family revoked during issuance");
                bounded(timeout, self.revocations.revoke(&access.token_id, access.expires_at)).await
            }
            other => other,
        }
    }

    async fn refresh(
        &self,
        client: &RegisteredClient,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<TokenResponse, OAuthError> {
        if refresh_token.is_empty() {
            return Err(OAuthError::invalid_request("refresh_token is required"));
        }
        if !client.allows_grant(GrantType::RefreshToken) {
            return Err(OAuthError::UnauthorizedClient);
        }
        let timeout = self.config.storage_timeout();
        let now = self.clock.now();
        let lookup = bounded(timeout, self.refresh_tokens.find(refresh_token, &client.client_id, now)).await?;
        let record = self.live_refresh_token(client, lookup).await?;
        let scopes = match scope {
            Some(raw) if !raw.trim().is_empty() => ScopeSet::parse(raw)?,
            _ => record.scopes.clone(),
        };
        if scopes.is_empty() || !scopes.is_subset(&record.scopes) {
            return Err(OAuthError::InvalidScope);
        }

        let refresh_token = if client.rotate_refresh_tokens {
            let taken = bounded(timeout, self.refresh_tokens.take(refresh_token, &client.client_id, now)).await?;
            let record = self.live_refresh_token(client, taken).await?;
            let successor = self.issuer.issue_refresh_token(
                &record.subject,
                &client.client_id,
                &record.scopes,
                client.refresh_token_ttl,
                Some(&record.family_id),
            )?;
            let token = successor.token.clone();
            self.store_refresh_token(successor).await?;
            token
        } else {
            record.token.clone()
        };

        let access = self
            .issuer
            .issue_access_token(&record.subject, &client.client_id, &scopes, client.access_token_ttl)?;
        self.track_access_token(&record.family_id, &access).await?;
        info!(
            client_id = %client.client_id,
            scope = %scopes,
            rotated = client.rotate_refresh_tokens,
            "tokens issued for refresh token"
        );
        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".into(),
            expires_in: access.expires_in,
            scope: access.scopes.to_string(),
            refresh_token: Some(refresh_token),
        })
    }

    /// Stores a freshly minted refresh token.
    ///
    /// If reuse detection revoked the family in the meantime the token is
    /// dropped and the grant still completes: the redemption itself happened
    /// exactly once, and the dropped token can never be redeemed.
    async fn store_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), OAuthError> {
        let client_id = record.client_id.clone();
        match bounded(self.config.storage_timeout(), self.refresh_tokens.put(record)).await {
            Err(OAuthError::InvalidGrant) => {
                warn!(client_id = %client_id, "refresh family revoked during issuance");
                Ok(())
            }
            other => other,
        }
    }

    async fn live_refresh_token(
        &self,
        client: &RegisteredClient,
        lookup: RefreshLookup,
    ) -> Result<RefreshTokenRecord, OAuthError> {
        match lookup {
            RefreshLookup::Active(record) => Ok(record),
            RefreshLookup::Rotated { family_id } => {
                let revoked = self.revoke_family(&family_id).await.unwrap_or_else(|error| {
                    warn!(error = %error, "refresh family revocation failed");
                    0
                });
                warn!(client_id = %client.client_id, revoked_tokens = revoked, "rotated refresh token reused");
                Err(OAuthError::InvalidGrant)
            }
            RefreshLookup::NotFound | RefreshLookup::Expired | RefreshLookup::Mismatch => Err(OAuthError::InvalidGrant),
        }
    }

    /// Token revocation (RFC 7009).
    ///
    /// A refresh token takes its whole family with it; an access token is
    /// recorded by id until it expires. Unknown tokens, and tokens issued to
    /// other clients, are ignored.
    #[instrument(skip(self, credentials, token), fields(client_id = %credentials.client_id), level = "debug")]
    pub async fn revoke(
        &self,
        credentials: &ClientCredentials,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<(), OAuthError> {
        let client = self.registry.authenticate(credentials).await?;
        if token.is_empty() {
            return Err(OAuthError::invalid_request("token is required"));
        }
        let revoked = if token_type_hint == Some("access_token") {
            self.revoke_access_token(&client, token).await? || self.revoke_refresh_token(&client, token).await?
        } else {
            self.revoke_refresh_token(&client, token).await? || self.revoke_access_token(&client, token).await?
        };
        debug!(client_id = %client.client_id, revoked, "revocation request handled");
        Ok(())
    }

    async fn revoke_refresh_token(&self, client: &RegisteredClient, token: &str) -> Result<bool, OAuthError> {
        let timeout = self.config.storage_timeout();
        let now = self.clock.now();
        let family_id = match bounded(timeout, self.refresh_tokens.find(token, &client.client_id, now)).await? {
            RefreshLookup::Active(record) => record.family_id,
            RefreshLookup::Rotated { family_id } => family_id,
            RefreshLookup::Expired | RefreshLookup::Mismatch => return Ok(true),
            RefreshLookup::NotFound => return Ok(false),
        };
        let count = self.revoke_family(&family_id).await?;
        info!(client_id = %client.client_id, revoked_tokens = count, "refresh token family revoked");
        Ok(true)
    }

    async fn revoke_access_token(&self, client: &RegisteredClient, token: &str) -> Result<bool, OAuthError> {
        let Ok(claims) = self.issuer.verify_access_token(token, None) else {
            return Ok(false);
        };
        if claims.client_id != client.client_id {
            return Ok(true);
        }
        let expires_at = claims.expires_at().ok_or(OAuthError::InvalidGrant)?;
        bounded(self.config.storage_timeout(), self.revocations.revoke(&claims.jti, expires_at)).await?;
        info!(client_id = %client.client_id, "access token revoked");
        Ok(true)
    }

    /// Full access token check: signature, issuer, audience, expiry and
    /// revocation.
    pub async fn verify_access_token(&self, token: &str, audience: Option<&str>) -> Result<AccessTokenClaims, OAuthError> {
        let claims = self.issuer.verify_access_token(token, audience)?;
        let revoked = bounded(self.config.storage_timeout(), self.revocations.is_revoked(&claims.jti))
            .await
            .map_err(|e| e.or_on_timeout(OAuthError::InvalidGrant))?;
        if revoked {
            return Err(OAuthError::InvalidGrant);
        }
        Ok(claims)
    }

    /// Forgets a resource owner's consent for a client. Issued tokens are
    /// not affected.
    pub async fn revoke_consent(&self, subject: &str, client_id: &str) -> Result<bool, OAuthError> {
        self.consent.revoke_consent(subject, client_id).await
    }

    /// Reclaims expired codes, tokens, revocation records, suspended
    /// requests and prunable keys.
    pub async fn sweep_expired(&self) -> Result<SweepReport, OAuthError> {
        let timeout = self.config.storage_timeout();
        let now = self.clock.now();
        let mut report = SweepReport {
            codes: bounded(timeout, self.codes.sweep_expired(now)).await?,
            refresh_tokens: bounded(timeout, self.refresh_tokens.sweep_expired(now)).await?,
            revocations: bounded(timeout, self.revocations.sweep_expired(now)).await?,
            ..SweepReport::default()
        };
        let before = self.suspended.len();
        self.suspended.retain(|_, s| now < s.expires_at);
        report.pending_consents = before.saturating_sub(self.suspended.len());
        report.keys = self.keys.prune()?.len();
        debug!(
            codes = report.codes,
            refresh_tokens = report.refresh_tokens,
            revocations = report.revocations,
            pending_consents = report.pending_consents,
            keys = report.keys,
            "expired entries swept"
        );
        Ok(report)
    }

    /// RFC 8414 metadata for this server.
    pub fn metadata(&self) -> ServerMetadata {
        let config = &self.config;
        let mut auth_methods = vec!["client_secret_basic".to_string(), "client_secret_post".to_string()];
        if config.allow_public_clients {
            auth_methods.push("none".into());
        }
        ServerMetadata {
            issuer: config.issuer.clone(),
            authorization_endpoint: config.endpoint_url(&config.authorize_endpoint),
            token_endpoint: config.endpoint_url(&config.token_endpoint),
            revocation_endpoint: config.endpoint_url(&config.revocation_endpoint),
            jwks_uri: config.endpoint_url(&config.jwks_endpoint),
            response_types_supported: vec!["code".into()],
            grant_types_supported: vec![
                GrantType::AuthorizationCode.as_str().into(),
                GrantType::RefreshToken.as_str().into(),
            ],
            token_endpoint_auth_methods_supported: auth_methods.clone(),
            revocation_endpoint_auth_methods_supported: auth_methods,
            code_challenge_methods_supported: vec!["S256".into()],
        }
    }
}

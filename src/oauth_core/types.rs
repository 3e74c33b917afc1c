//! OAuth2 core primitives: clients, scopes, codes, refresh tokens and consent.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use super::crypto;
use super::error::OAuthError;

/// OAuth2 grant types understood by the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `authorization_code`
    AuthorizationCode,
    /// `refresh_token`
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl FromStr for GrantType {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            _ => Err(OAuthError::UnsupportedGrantType),
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a client proves its identity at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// Secret in an HTTP Basic `Authorization` header.
    ClientSecretBasic,
    /// Secret in the `client_secret` form field.
    ClientSecretPost,
    /// Public client, no secret. Only usable with a PKCE code verifier.
    None,
}

impl ClientAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMethod::ClientSecretBasic => "client_secret_basic",
            ClientAuthMethod::ClientSecretPost => "client_secret_post",
            ClientAuthMethod::None => "none",
        }
    }
}

/// A set of scope tokens.
///
/// Ordered so the space-delimited rendering is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// An empty scope set.
    pub fn new() -> Self {
        ScopeSet(BTreeSet::new())
    }

    /// Parses a space-delimited `scope` parameter.
    ///
    /// Each token must be made of the characters allowed by RFC 6749 section 3.3.
    pub fn parse(raw: &str) -> Result<Self, OAuthError> {
        let mut set = BTreeSet::new();
        for token in raw.split(' ').filter(|t| !t.is_empty()) {
            let valid = token
                .bytes()
                .all(|b| b == 0x21 || (0x23..=0x5B).contains(&b) || (0x5D..=0x7E).contains(&b));
            if !valid {
                return Err(OAuthError::InvalidScope);
            }
            set.insert(token.to_string());
        }
        Ok(ScopeSet(set))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn is_subset(&self, other: &ScopeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Union of both sets.
    pub fn union(&self, other: &ScopeSet) -> ScopeSet {
        ScopeSet(self.0.union(&other.0).cloned().collect())
    }

    /// Scopes in `self` that `other` lacks.
    pub fn difference(&self, other: &ScopeSet) -> ScopeSet {
        ScopeSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        ScopeSet(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for ScopeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScopeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ScopeSet::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A registered OAuth2 client.
///
/// Loaded from a [`ClientStore`](super::oauth_provider::ClientStore) and treated
/// as immutable for the duration of a request.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    /// Client identifier.
    pub client_id: String,
    /// Hashed secret (see [`crypto::hash_secret`]); `None` for public clients.
    pub secret_hash: Option<String>,
    /// Registered token endpoint authentication method.
    pub auth_method: ClientAuthMethod,
    /// Grant types the client may use.
    pub grant_types: Vec<GrantType>,
    /// Redirect URIs, matched exactly.
    pub redirect_uris: Vec<String>,
    /// Scopes the client may request.
    pub scopes: ScopeSet,
    /// Whether the resource owner must approve the requested scopes.
    pub require_consent: bool,
    /// Whether authorize requests must carry a PKCE challenge.
    pub require_pkce: bool,
    /// Access token lifetime.
    pub access_token_ttl: Duration,
    /// Refresh token lifetime.
    pub refresh_token_ttl: Duration,
    /// Whether every refresh must rotate the refresh token.
    pub rotate_refresh_tokens: bool,
}

impl RegisteredClient {
    /// A confidential client authenticating with `client_secret_basic`.
    ///
    /// The secret is hashed immediately; the plain value is not retained.
    pub fn confidential(client_id: impl Into<String>, secret: &str) -> Result<Self, OAuthError> {
        let mut client = Self::base(client_id.into());
        client.secret_hash = Some(crypto::hash_secret(secret)?);
        Ok(client)
    }

    /// A public client. It must present a PKCE verifier and is only accepted
    /// when the server allows public clients.
    pub fn public(client_id: impl Into<String>) -> Self {
        let mut client = Self::base(client_id.into());
        client.auth_method = ClientAuthMethod::None;
        client.require_pkce = true;
        client
    }

    fn base(client_id: String) -> Self {
        RegisteredClient {
            client_id,
            secret_hash: None,
            auth_method: ClientAuthMethod::ClientSecretBasic,
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            redirect_uris: Vec::new(),
            scopes: ScopeSet::new(),
            require_consent: true,
            require_pkce: false,
            access_token_ttl: Duration::seconds(300),
            refresh_token_ttl: Duration::days(30),
            rotate_refresh_tokens: true,
        }
    }

    /// Adds a redirect URI.
    pub fn redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uris.push(uri.into());
        self
    }

    /// Sets the allowed scopes.
    pub fn scopes<S: Into<String>>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    /// Sets the allowed grant types.
    pub fn grant_types(mut self, grant_types: impl IntoIterator<Item = GrantType>) -> Self {
        self.grant_types = grant_types.into_iter().collect();
        self
    }

    /// Overrides the token endpoint authentication method.
    pub fn auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    pub fn require_consent(mut self, required: bool) -> Self {
        self.require_consent = required;
        self
    }

    pub fn require_pkce(mut self, required: bool) -> Self {
        self.require_pkce = required;
        self
    }

    pub fn access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    pub fn refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    pub fn rotate_refresh_tokens(mut self, rotate: bool) -> Self {
        self.rotate_refresh_tokens = rotate;
        self
    }

    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    /// Exact, case-sensitive match against the registered redirect URIs.
    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|registered| registered == uri)
    }

    pub fn is_public(&self) -> bool {
        self.auth_method == ClientAuthMethod::None
    }

    /// Whether tokens issued to this client come with a refresh token.
    pub fn refresh_eligible(&self) -> bool {
        self.allows_grant(GrantType::RefreshToken)
    }
}

/// A pending grant, addressable by its single-use code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    /// The code value handed to the client.
    pub code: String,
    pub client_id: String,
    /// Redirect URI the code was issued against.
    pub redirect_uri: String,
    /// Scopes granted by the resource owner.
    pub scopes: ScopeSet,
    /// Resource owner identity.
    pub subject: String,
    pub nonce: Option<String>,
    /// S256 PKCE challenge, when the authorize request carried one.
    pub code_challenge: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Identifiers of the tokens minted from one authorization code.
///
/// Recorded atomically when the code is consumed so that a replay can revoke
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokenIds {
    /// `jti` of the access token.
    pub access_token_id: String,
    /// Expiry of the access token, bounding how long its revocation must be kept.
    pub access_expires_at: DateTime<Utc>,
    /// Refresh token family started by the code, if any.
    pub refresh_family: Option<String>,
}

/// A stored refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    /// Opaque token value.
    pub token: String,
    pub client_id: String,
    pub subject: String,
    /// Scopes granted with the original authorization code.
    pub scopes: ScopeSet,
    /// Rotation family shared by every token descending from one code.
    pub family_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Scopes a resource owner has approved for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRecord {
    pub subject: String,
    pub client_id: String,
    pub scopes: ScopeSet,
    pub granted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Successful token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Signed access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Granted scopes, space-delimited.
    pub scope: String,
    /// Refresh token, when the client is refresh-eligible.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refresh_token: Option<String>,
}

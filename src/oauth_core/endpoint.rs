//! HTTP-shaped protocol surface over [`AuthorizationServer`].
//!
//! Routing and transport are left to the host server. These handlers take a
//! parsed [`HttpRequest`] and produce an [`HttpResponse`]; the token and
//! revocation endpoints run a fixed pipeline: rate limit, credential
//! extraction, grant dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};
use super::error::OAuthError;
use super::grant::{
    AuthorizationRequest, AuthorizationServer, AuthorizeError, AuthorizeOutcome, ConsentDecision,
    PendingConsent, SweepReport, TokenRequest,
};
use super::rate_limiter::{InMemoryRateLimiter, RateLimiter};
use super::registry::ClientCredentials;
use super::types::{GrantType, ScopeSet};

/// Path of the RFC 8414 metadata document.
pub const METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// An incoming request, already read off the wire.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.).
    pub method: String,
    /// Path and optional query string.
    pub target: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(target: impl Into<String>) -> Self {
        Self { method: "GET".into(), target: target.into(), ..Default::default() }
    }

    /// A POST with an `application/x-www-form-urlencoded` body.
    pub fn post_form(target: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".into(),
            target: target.into(),
            headers: vec![("Content-Type".into(), "application/x-www-form-urlencoded".into())],
            body: body.into().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, query)| query)
    }
}

/// An outgoing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A JSON response that must not be cached (RFC 6749 section 5.1).
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        HttpResponse {
            status,
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("Cache-Control".into(), "no-store".into()),
                ("Pragma".into(), "no-cache".into()),
            ],
            body,
        }
    }

    /// A JSON document that clients may cache.
    pub fn public_json<T: Serialize>(value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        HttpResponse {
            status: 200,
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("Cache-Control".into(), "public, max-age=300".into()),
            ],
            body,
        }
    }

    /// `302 Found` to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        HttpResponse {
            status: 302,
            headers: vec![("Location".into(), location.into()), ("Cache-Control".into(), "no-store".into())],
            body: Vec::new(),
        }
    }

    pub fn empty(status: u16) -> Self {
        HttpResponse { status, headers: vec![("Cache-Control".into(), "no-store".into())], body: Vec::new() }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body parsed as JSON, for callers that inspect responses.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

impl OAuthError {
    /// Converts the error into a JSON error response.
    pub fn into_response(&self) -> HttpResponse {
        let status = self.status();
        let code = self.error_code();
        // Structured log
        warn!(error = %self, error_code = code, http_status = status, "OAuth error occurred");
        let mut resp = HttpResponse::json(
            status,
            &json!({ "error": code, "error_description": self.error_description() }),
        );
        if status == 401 {
            resp.headers.push(("WWW-Authenticate".into(), r#"Basic realm="oauth""#.into()));
        }
        resp
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Parses a query string or form body.
///
/// Repeated parameters are rejected (RFC 6749 section 3.1); parameters sent
/// without a value are treated as omitted.
pub fn parse_params(raw: &[u8]) -> Result<HashMap<String, String>, OAuthError> {
    let mut params = HashMap::new();
    for (key, value) in form_urlencoded::parse(raw) {
        if params.contains_key(&*key) {
            return Err(OAuthError::invalid_request(format!("duplicate parameter: {}", key)));
        }
        if !value.is_empty() {
            params.insert(key.into_owned(), value.into_owned());
        }
    }
    Ok(params)
}

/// Decodes an HTTP Basic `Authorization` header into client id and secret.
///
/// Both halves are form-urlencoded before base64 (RFC 6749 section 2.3.1).
pub fn basic_credentials(header: &str) -> Result<(String, String), OAuthError> {
    let (scheme, encoded) = header.trim().split_once(' ').ok_or(OAuthError::InvalidClient)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(OAuthError::InvalidClient);
    }
    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| OAuthError::InvalidClient)?;
    let decoded = String::from_utf8(decoded).map_err(|_| OAuthError::InvalidClient)?;
    let (client_id, secret) = decoded.split_once(':').ok_or(OAuthError::InvalidClient)?;
    let client_id = form_decode(client_id)?;
    if client_id.is_empty() {
        return Err(OAuthError::InvalidClient);
    }
    Ok((client_id, form_decode(secret)?))
}

fn form_decode(raw: &str) -> Result<String, OAuthError> {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8()
        .map(|value| value.into_owned())
        .map_err(|_| OAuthError::InvalidClient)
}

/// Appends query parameters to a redirect URI, keeping any it already has.
pub fn append_query(uri: &str, params: &[(&str, &str)]) -> Result<String, OAuthError> {
    let mut url = Url::parse(uri).map_err(|_| OAuthError::InvalidRedirectUri)?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.into())
}

/// Body returned when the authorize step waits for consent.
#[derive(Debug, Clone, Serialize)]
struct ConsentPrompt<'a> {
    consent_ticket: &'a str,
    client_id: &'a str,
    scope: String,
    missing_scope: String,
    expires_at: i64,
}

impl<'a> From<&'a PendingConsent> for ConsentPrompt<'a> {
    fn from(pending: &'a PendingConsent) -> Self {
        ConsentPrompt {
            consent_ticket: &pending.ticket,
            client_id: &pending.client_id,
            scope: pending.requested.to_string(),
            missing_scope: pending.missing.to_string(),
            expires_at: pending.expires_at.timestamp(),
        }
    }
}

/// The OAuth2 endpoints of one [`AuthorizationServer`].
#[derive(Clone)]
pub struct Endpoints {
    server: Arc<AuthorizationServer>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl Endpoints {
    /// Endpoints with the in-memory rate limiter from the server configuration.
    pub fn new(server: Arc<AuthorizationServer>) -> Self {
        let rate_limiter = Arc::new(InMemoryRateLimiter::from_config(&server.config().token_rate_limit));
        Self { server, rate_limiter }
    }

    /// Sets a custom rate limiter.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn server(&self) -> &Arc<AuthorizationServer> {
        &self.server
    }

    /// [`AuthorizationServer::sweep_expired`], plus idle rate limit buckets.
    pub async fn sweep_expired(&self) -> Result<SweepReport, OAuthError> {
        let mut report = self.server.sweep_expired().await?;
        report.rate_limit_buckets = self.rate_limiter.sweep().await?;
        if report.rate_limit_buckets > 0 {
            debug!(buckets = report.rate_limit_buckets, "idle rate limit buckets swept");
        }
        Ok(report)
    }

    /// Routes a request by path and method.
    ///
    /// `subject` is the resource owner authenticated by the host, if any;
    /// only the authorize endpoint uses it.
    pub async fn handle(&self, req: &HttpRequest, subject: Option<&str>) -> HttpResponse {
        let config = self.server.config();
        let path = req.path();
        let method = req.method.to_ascii_uppercase();
        debug!(method = %method, path, "oauth request");
        match method.as_str() {
            "GET" if path == config.authorize_endpoint => self.handle_authorize(req.query(), subject).await,
            "POST" if path == config.authorize_endpoint => self.handle_consent(&req.body, subject).await,
            "POST" if path == config.token_endpoint => self.handle_token(req).await,
            "POST" if path == config.revocation_endpoint => self.handle_revoke(req).await,
            "GET" if path == config.jwks_endpoint => self.handle_jwks(),
            "GET" if path == METADATA_PATH => self.handle_metadata(),
            _ => {
                let known = [
                    config.authorize_endpoint.as_str(),
                    config.token_endpoint.as_str(),
                    config.revocation_endpoint.as_str(),
                    config.jwks_endpoint.as_str(),
                    METADATA_PATH,
                ];
                if known.contains(&path) {
                    HttpResponse::empty(405)
                } else {
                    HttpResponse::empty(404)
                }
            }
        }
    }

    /// `GET` authorize: redirects with a code, redirects with an error, or
    /// returns a consent prompt.
    pub async fn handle_authorize(&self, query: &str, subject: Option<&str>) -> HttpResponse {
        let params = match parse_params(query.as_bytes()) {
            Ok(params) => params,
            Err(err) => return err.into_response(),
        };
        let take = |key: &str| params.get(key).cloned();
        let request = AuthorizationRequest {
            response_type: take("response_type").unwrap_or_default(),
            client_id: take("client_id").unwrap_or_default(),
            redirect_uri: take("redirect_uri").unwrap_or_default(),
            scope: take("scope"),
            state: take("state"),
            nonce: take("nonce"),
            code_challenge: take("code_challenge"),
            code_challenge_method: take("code_challenge_method"),
            subject: subject.unwrap_or_default().to_string(),
        };
        match self.server.authorize(request).await {
            Ok(AuthorizeOutcome::Issued(response)) => match response.redirect_url() {
                Ok(location) => HttpResponse::redirect(location),
                Err(err) => err.into_response(),
            },
            Ok(AuthorizeOutcome::ConsentRequired(pending)) => {
                HttpResponse::json(200, &ConsentPrompt::from(&pending))
            }
            Err(err) => authorize_error_response(&err),
        }
    }

    /// `POST` authorize: the consent form. Fields: `consent_ticket`,
    /// `decision` (`approve` or `deny`) and an optional narrowed `scope`.
    pub async fn handle_consent(&self, body: &[u8], subject: Option<&str>) -> HttpResponse {
        let params = match parse_params(body) {
            Ok(params) => params,
            Err(err) => return err.into_response(),
        };
        let Some(ticket) = params.get("consent_ticket") else {
            return OAuthError::invalid_request("consent_ticket is required").into_response();
        };
        let decision = match params.get("decision").map(String::as_str) {
            Some("approve") => match params.get("scope").map(|raw| ScopeSet::parse(raw)).transpose() {
                Ok(scopes) => ConsentDecision::Grant { scopes },
                Err(err) => return err.into_response(),
            },
            Some("deny") => ConsentDecision::Deny,
            _ => return OAuthError::invalid_request("decision must be 'approve' or 'deny'").into_response(),
        };
        match self.server.decide_consent(ticket, subject.unwrap_or_default(), decision).await {
            Ok(response) => match response.redirect_url() {
                Ok(location) => HttpResponse::redirect(location),
                Err(err) => err.into_response(),
            },
            Err(err) => authorize_error_response(&err),
        }
    }

    /// `POST` token.
    pub async fn handle_token(&self, req: &HttpRequest) -> HttpResponse {
        let (form, credentials) = match self.admit(req).await {
            Ok(admitted) => admitted,
            Err(err) => return err.into_response(),
        };
        let request = match token_request(&form) {
            Ok(request) => request,
            Err(err) => return err.into_response(),
        };
        match self.server.exchange(request, &credentials).await {
            Ok(tokens) => HttpResponse::json(200, &tokens),
            Err(err) => err.into_response(),
        }
    }

    /// `POST` revoke (RFC 7009). Answers 200 for unknown tokens.
    pub async fn handle_revoke(&self, req: &HttpRequest) -> HttpResponse {
        let (form, credentials) = match self.admit(req).await {
            Ok(admitted) => admitted,
            Err(err) => return err.into_response(),
        };
        let token = form.get("token").map(String::as_str).unwrap_or_default();
        let hint = form.get("token_type_hint").map(String::as_str);
        match self.server.revoke(&credentials, token, hint).await {
            Ok(()) => HttpResponse::empty(200),
            Err(err) => err.into_response(),
        }
    }

    /// `GET` JWK Set.
    pub fn handle_jwks(&self) -> HttpResponse {
        match self.server.public_key_set() {
            Ok(keys) => HttpResponse::public_json(&keys),
            Err(err) => err.into_response(),
        }
    }

    /// `GET` authorization server metadata.
    pub fn handle_metadata(&self) -> HttpResponse {
        HttpResponse::public_json(&self.server.metadata())
    }

    /// Rate limit, then credential extraction.
    async fn admit(&self, req: &HttpRequest) -> Result<(HashMap<String, String>, ClientCredentials), OAuthError> {
        let form = parse_params(&req.body)?;
        let authorization = req.header("authorization");
        let claimed = claimed_client_id(authorization, &form);
        if !self.rate_limiter.consume(&claimed).await? {
            warn!(client_id = %claimed, "token endpoint rate limit exceeded");
            return Err(OAuthError::RateLimited);
        }
        let credentials = extract_credentials(authorization, &form)?;
        Ok((form, credentials))
    }
}

fn authorize_error_response(err: &AuthorizeError) -> HttpResponse {
    match err.redirect_url() {
        Some(location) => HttpResponse::redirect(location),
        None => err.error.into_response(),
    }
}

fn claimed_client_id(authorization: Option<&str>, form: &HashMap<String, String>) -> String {
    authorization
        .and_then(|header| basic_credentials(header).ok())
        .map(|(client_id, _)| client_id)
        .or_else(|| form.get("client_id").cloned())
        .unwrap_or_default()
}

/// Picks exactly one client authentication method.
fn extract_credentials(
    authorization: Option<&str>,
    form: &HashMap<String, String>,
) -> Result<ClientCredentials, OAuthError> {
    let form_id = form.get("client_id");
    let form_secret = form.get("client_secret");
    if let Some(header) = authorization {
        if form_secret.is_some() {
            return Err(OAuthError::invalid_request("multiple client authentication methods"));
        }
        let (client_id, secret) = basic_credentials(header)?;
        if form_id.is_some_and(|id| *id != client_id) {
            return Err(OAuthError::invalid_request("client_id does not match the Authorization header"));
        }
        return Ok(ClientCredentials::basic(client_id, secret));
    }
    match (form_id, form_secret) {
        (Some(client_id), Some(secret)) => Ok(ClientCredentials::post(client_id.clone(), secret.clone())),
        (Some(client_id), None) => Ok(ClientCredentials::public(client_id.clone())),
        (None, _) => Err(OAuthError::InvalidClient),
    }
}

fn token_request(form: &HashMap<String, String>) -> Result<TokenRequest, OAuthError> {
    let grant_type: GrantType = form
        .get("grant_type")
        .ok_or_else(|| OAuthError::invalid_request("grant_type is required"))?
        .parse()?;
    let field = |key: &str| form.get(key).cloned();
    Ok(match grant_type {
        GrantType::AuthorizationCode => TokenRequest::AuthorizationCode {
            code: field("code").unwrap_or_default(),
            redirect_uri: field("redirect_uri").unwrap_or_default(),
            code_verifier: field("code_verifier"),
        },
        GrantType::RefreshToken => TokenRequest::RefreshToken {
            refresh_token: field("refresh_token").unwrap_or_default(),
            scope: field("scope"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_parameters_are_rejected() {
        let err = parse_params(b"client_id=a&scope=read&client_id=b").unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
        let params = parse_params(b"scope=read+write&state=").unwrap();
        assert_eq!(params.get("scope").map(String::as_str), Some("read write"));
        assert!(!params.contains_key("state"));
    }

    #[test]
    fn redirect_keeps_existing_query() {
        let url = append_query("https://app/cb?x=1", &[("code", "a b"), ("state", "s")]).unwrap();
        assert_eq!(url, "https://app/cb?x=1&code=a+b&state=s");
        assert_eq!(append_query("not a url", &[]), Err(OAuthError::InvalidRedirectUri));
    }

    #[test]
    fn header_and_form_credentials_are_exclusive() {
        let mut form = HashMap::new();
        form.insert("client_secret".to_string(), "x".to_string());
        let header = format!("Basic {}", STANDARD.encode("c1:s1"));
        assert!(matches!(
            extract_credentials(Some(&header), &form),
            Err(OAuthError::InvalidRequest(_))
        ));
        form.clear();
        form.insert("client_id".to_string(), "c1".to_string());
        let credentials = extract_credentials(Some(&header), &form).unwrap();
        assert_eq!(credentials, ClientCredentials::basic("c1", "s1"));
        assert_eq!(extract_credentials(None, &HashMap::new()), Err(OAuthError::InvalidClient));
    }
}

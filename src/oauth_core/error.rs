//! Error types for the authorization core.

use std::fmt;

/// Broad classes of failure, mirroring how each one is surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing request fields.
    Validation,
    /// Unknown client, bad credential, disallowed grant/redirect/scope.
    Client,
    /// Code or refresh token missing, expired, mismatched or reused.
    Grant,
    /// The resource owner refused the request.
    ConsentDenied,
    /// Key material, storage or other server-side failure.
    Server,
}

/// Protocol errors produced by the authorization core.
///
/// Every variant maps onto one of the standard OAuth2 error codes through
/// [`OAuthError::error_code`]. Variants deliberately carry no information about
/// which entity was missing: an unknown code and a consumed code are both
/// `InvalidGrant`, an unknown client and a wrong secret are both `InvalidClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthError {
    /// A required parameter is missing, repeated or malformed.
    InvalidRequest(String),
    /// Client authentication failed or the client is unknown.
    InvalidClient,
    /// The redirect URI is not registered for the client.
    InvalidRedirectUri,
    /// The client may not use the requested grant type.
    UnauthorizedClient,
    /// The grant type is not supported by this server.
    UnsupportedGrantType,
    /// The response type is not supported by this server.
    UnsupportedResponseType,
    /// The requested scope exceeds what is allowed.
    InvalidScope,
    /// The code or refresh token is invalid, expired, mismatched or reused.
    InvalidGrant,
    /// The resource owner denied the request.
    AccessDenied,
    /// The caller exceeded its request budget.
    RateLimited,
    /// A storage call did not finish within its time budget.
    Timeout,
    /// Signing key unavailable or token encoding failed.
    SigningFailure(String),
    /// Backend storage failure.
    Storage(String),
}

impl OAuthError {
    /// Shorthand for an `invalid_request` error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        OAuthError::InvalidRequest(msg.into())
    }

    /// Shorthand for a signing failure.
    pub fn signing(msg: impl Into<String>) -> Self {
        OAuthError::SigningFailure(msg.into())
    }

    /// Shorthand for a storage failure.
    pub fn storage(msg: impl Into<String>) -> Self {
        OAuthError::Storage(msg.into())
    }

    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OAuthError::InvalidRequest(_)
            | OAuthError::UnsupportedGrantType
            | OAuthError::UnsupportedResponseType => ErrorKind::Validation,
            OAuthError::InvalidClient
            | OAuthError::InvalidRedirectUri
            | OAuthError::UnauthorizedClient
            | OAuthError::InvalidScope => ErrorKind::Client,
            OAuthError::InvalidGrant => ErrorKind::Grant,
            OAuthError::AccessDenied => ErrorKind::ConsentDenied,
            OAuthError::RateLimited
            | OAuthError::Timeout
            | OAuthError::SigningFailure(_)
            | OAuthError::Storage(_) => ErrorKind::Server,
        }
    }

    /// Standard OAuth2 error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) | OAuthError::InvalidRedirectUri => "invalid_request",
            OAuthError::InvalidClient => "invalid_client",
            OAuthError::UnauthorizedClient => "unauthorized_client",
            OAuthError::UnsupportedGrantType => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType => "unsupported_response_type",
            OAuthError::InvalidScope => "invalid_scope",
            OAuthError::InvalidGrant => "invalid_grant",
            OAuthError::AccessDenied => "access_denied",
            OAuthError::RateLimited => "rate_limited",
            OAuthError::Timeout | OAuthError::SigningFailure(_) | OAuthError::Storage(_) => {
                "server_error"
            }
        }
    }

    /// Human readable description safe to return to the caller.
    pub fn error_description(&self) -> String {
        match self {
            OAuthError::InvalidRequest(msg) => msg.clone(),
            OAuthError::InvalidClient => "Client authentication failed".into(),
            OAuthError::InvalidRedirectUri => {
                "invalid_redirect_uri: redirect_uri is not registered for this client".into()
            }
            OAuthError::UnauthorizedClient => {
                "The client is not authorized to use this grant type".into()
            }
            OAuthError::UnsupportedGrantType => "The grant type is not supported".into(),
            OAuthError::UnsupportedResponseType => "Only the 'code' response type is supported".into(),
            OAuthError::InvalidScope => "The requested scope is invalid or exceeds the allowed scope".into(),
            OAuthError::InvalidGrant => "The provided grant is invalid, expired or revoked".into(),
            OAuthError::AccessDenied => "The resource owner denied the request".into(),
            OAuthError::RateLimited => "Too many requests".into(),
            // Server-side detail never leaves the process.
            OAuthError::Timeout | OAuthError::SigningFailure(_) | OAuthError::Storage(_) => {
                "Internal server error".into()
            }
        }
    }

    /// HTTP status for a JSON error response.
    pub fn status(&self) -> u16 {
        match self {
            OAuthError::InvalidClient => 401,
            OAuthError::AccessDenied => 403,
            OAuthError::RateLimited => 429,
            OAuthError::Timeout | OAuthError::SigningFailure(_) | OAuthError::Storage(_) => 500,
            _ => 400,
        }
    }

    /// Replaces a timeout with the terminal state the caller should observe.
    ///
    /// The authorize step treats a timeout as `Rejected`, the token step as
    /// `Expired`; neither leaves a grant half-committed.
    pub fn or_on_timeout(self, terminal: OAuthError) -> OAuthError {
        match self {
            OAuthError::Timeout => terminal,
            other => other,
        }
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OAuthError::SigningFailure(msg) => write!(f, "server_error: signing failed: {}", msg),
            OAuthError::Storage(msg) => write!(f, "server_error: storage failed: {}", msg),
            OAuthError::Timeout => write!(f, "server_error: storage call timed out"),
            other => write!(f, "{}: {}", other.error_code(), other.error_description()),
        }
    }
}

impl std::error::Error for OAuthError {}

impl From<tokio::time::error::Elapsed> for OAuthError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        OAuthError::Timeout
    }
}

impl From<jsonwebtoken::errors::Error> for OAuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        OAuthError::SigningFailure(err.to_string())
    }
}

impl From<ring::error::Unspecified> for OAuthError {
    fn from(_err: ring::error::Unspecified) -> Self {
        OAuthError::SigningFailure("cryptographic operation failed".into())
    }
}

/// Errors raised while loading or validating [`AuthzConfig`](super::config::AuthzConfig).
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(std::io::Error),
    /// The configuration could not be parsed.
    Parse(String),
    /// A value is out of range or inconsistent.
    Invalid { key: String, message: String },
    /// No signing key could be set up.
    Keys(OAuthError),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid { key: key.to_string(), message: message.into() }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "I/O error: {}", err),
            ConfigError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::Invalid { key, message } => write!(f, "Invalid value for '{}': {}", key, message),
            ConfigError::Keys(err) => write!(f, "Signing key setup failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Keys(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<OAuthError> for ConfigError {
    fn from(err: OAuthError) -> Self {
        ConfigError::Keys(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

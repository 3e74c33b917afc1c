pub mod clock;
pub mod config;
pub mod consent;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod grant;
pub mod jwks;
pub mod jwt;
pub mod memory;
pub mod oauth_provider;
pub mod rate_limiter;
pub mod registry;
pub mod sweeper;
pub mod types;

use std::future::Future;
use std::time::Duration;
use error::OAuthError;

/// Runs a storage call under a time budget. An overrun is `OAuthError::Timeout`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, OAuthError>>,
) -> Result<T, OAuthError> {
    tokio::time::timeout(limit, call).await?
}

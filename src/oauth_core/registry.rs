//! Client registry: resolution and token endpoint authentication.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{instrument, warn};
use super::bounded;
use super::crypto;
use super::error::OAuthError;
use super::oauth_provider::ClientStore;
use super::types::{ClientAuthMethod, RegisteredClient};

/// Credentials presented by a client at the token or revocation endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub secret: Option<String>,
    /// How the credential was transported.
    pub method: ClientAuthMethod,
}

impl ClientCredentials {
    /// Credentials from an HTTP Basic header.
    pub fn basic(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            secret: Some(secret.into()),
            method: ClientAuthMethod::ClientSecretBasic,
        }
    }

    /// Credentials from the `client_id` / `client_secret` form fields.
    pub fn post(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            secret: Some(secret.into()),
            method: ClientAuthMethod::ClientSecretPost,
        }
    }

    /// A public client identifying itself by `client_id` only.
    pub fn public(client_id: impl Into<String>) -> Self {
        Self { client_id: client_id.into(), secret: None, method: ClientAuthMethod::None }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("method", &self.method)
            .finish()
    }
}

/// Resolves and authenticates clients over a [`ClientStore`].
#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
    allow_public_clients: bool,
    timeout: Duration,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn ClientStore>, allow_public_clients: bool, timeout: Duration) -> Self {
        Self { store, allow_public_clients, timeout }
    }

    /// Looks up a client. Unknown clients are `InvalidClient`.
    pub async fn resolve(&self, client_id: &str) -> Result<RegisteredClient, OAuthError> {
        bounded(self.timeout, self.store.get_client(client_id))
            .await?
            .ok_or(OAuthError::InvalidClient)
    }

    /// Authenticates a client and returns its registration.
    ///
    /// Every failure, including an unknown client id, yields the same
    /// `InvalidClient` error. Failures before the real secret check still pay
    /// for a hash verification, so timing does not reveal which ids exist.
    #[instrument(skip(self, credentials), fields(client_id = %credentials.client_id), level = "debug")]
    pub async fn authenticate(&self, credentials: &ClientCredentials) -> Result<RegisteredClient, OAuthError> {
        let client = match bounded(self.timeout, self.store.get_client(&credentials.client_id)).await? {
            Some(client) => client,
            None => {
                verify_against_dummy(credentials.secret.as_deref());
                warn!(reason = "unknown_client", "client authentication failed");
                return Err(OAuthError::InvalidClient);
            }
        };
        if credentials.method != client.auth_method {
            verify_against_dummy(credentials.secret.as_deref());
            warn!(reason = "auth_method", presented = credentials.method.as_str(), "client authentication failed");
            return Err(OAuthError::InvalidClient);
        }
        let verified = match (credentials.method, &credentials.secret, &client.secret_hash) {
            (ClientAuthMethod::None, None, None) => self.allow_public_clients,
            (ClientAuthMethod::ClientSecretBasic | ClientAuthMethod::ClientSecretPost, Some(secret), Some(hash)) => {
                crypto::verify_secret(secret, hash)
            }
            _ => {
                verify_against_dummy(credentials.secret.as_deref());
                false
            }
        };
        if !verified {
            warn!(reason = "credential", "client authentication failed");
            return Err(OAuthError::InvalidClient);
        }
        Ok(client)
    }
}

fn verify_against_dummy(secret: Option<&str>) {
    if let (Some(secret), Some(dummy)) = (secret, dummy_hash()) {
        let _ = crypto::verify_secret(secret, dummy);
    }
}

fn dummy_hash() -> Option<&'static String> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY.get_or_init(|| crypto::hash_secret("starberry-authz-dummy").ok()).as_ref()
}

#[cfg(test)]
mod tests {
    use std::time::Instant;
    use super::*;
    use crate::oauth_core::memory::InMemoryClientStore;

    fn registry() -> ClientRegistry {
        let client = RegisteredClient::confidential("c1", "secret").unwrap().redirect_uri("https://app/cb");
        let store = Arc::new(InMemoryClientStore::new(vec![client]));
        ClientRegistry::new(store, false, Duration::from_secs(2))
    }

    async fn time_failures(registry: &ClientRegistry, credentials: &ClientCredentials) -> Duration {
        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(registry.authenticate(credentials).await.unwrap_err(), OAuthError::InvalidClient);
        }
        started.elapsed()
    }

    #[tokio::test]
    async fn failures_cost_a_hash_verification() {
        let registry = registry();
        // Warm the dummy hash so its one-off derivation is not measured
        let _ = registry.authenticate(&ClientCredentials::basic("nobody", "x")).await;

        let wrong_secret = time_failures(&registry, &ClientCredentials::basic("c1", "wrong")).await;
        let wrong_method = time_failures(&registry, &ClientCredentials::post("c1", "wrong")).await;
        let unknown = time_failures(&registry, &ClientCredentials::basic("nobody", "wrong")).await;
        assert!(wrong_method * 4 >= wrong_secret, "{:?} vs {:?}", wrong_method, wrong_secret);
        assert!(unknown * 4 >= wrong_secret, "{:?} vs {:?}", unknown, wrong_secret);
    }

    #[tokio::test]
    async fn registered_method_and_secret_authenticate() {
        let registry = registry();
        let client = registry.authenticate(&ClientCredentials::basic("c1", "secret")).await.unwrap();
        assert_eq!(client.client_id, "c1");
        assert_eq!(
            registry.authenticate(&ClientCredentials::public("c1")).await.unwrap_err(),
            OAuthError::InvalidClient
        );
    }
}

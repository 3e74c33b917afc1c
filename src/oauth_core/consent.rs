//! Consent tracking per (resource owner, client).

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use super::bounded;
use super::error::OAuthError;
use super::oauth_provider::ConsentStore;
use super::types::{ConsentRecord, ScopeSet};

/// Remembers which scopes a resource owner approved for a client so they are
/// not asked again.
#[derive(Clone)]
pub struct ConsentTracker {
    store: Arc<dyn ConsentStore>,
    timeout: Duration,
}

impl ConsentTracker {
    pub fn new(store: Arc<dyn ConsentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Whether a prior consent covers every scope in `scopes`.
    pub async fn has_consent(&self, subject: &str, client_id: &str, scopes: &ScopeSet) -> Result<bool, OAuthError> {
        let record = bounded(self.timeout, self.store.get(subject, client_id)).await?;
        Ok(record.is_some_and(|r| scopes.is_subset(&r.scopes)))
    }

    /// Scopes of `scopes` the owner has not yet approved.
    pub async fn missing_scopes(&self, subject: &str, client_id: &str, scopes: &ScopeSet) -> Result<ScopeSet, OAuthError> {
        let record = bounded(self.timeout, self.store.get(subject, client_id)).await?;
        Ok(match record {
            Some(record) => scopes.difference(&record.scopes),
            None => scopes.clone(),
        })
    }

    /// Adds `scopes` to the owner's consent. Never removes scopes.
    pub async fn record_consent(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &ScopeSet,
        now: DateTime<Utc>,
    ) -> Result<ConsentRecord, OAuthError> {
        let record = bounded(self.timeout, self.store.merge(subject, client_id, scopes, now)).await?;
        debug!(client_id, scope = %record.scopes, "consent recorded");
        Ok(record)
    }

    /// Administrative removal of a consent record.
    pub async fn revoke_consent(&self, subject: &str, client_id: &str) -> Result<bool, OAuthError> {
        let removed = bounded(self.timeout, self.store.remove(subject, client_id)).await?;
        if removed {
            info!(client_id, "consent revoked");
        }
        Ok(removed)
    }
}

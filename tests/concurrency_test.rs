use std::sync::Arc;
use chrono::Utc;
use starberry_authz::oauth_core::oauth_provider::ConsentStore;
use starberry_authz::{
    AuthorizationRequest, AuthorizationServer, AuthorizeOutcome, AuthzConfig, ClientCredentials,
    Clock, ConsentDecision, InMemoryClientStore, InMemoryConsentStore, OAuthError, RegisteredClient, ScopeSet,
    TokenRequest, TokenResponse,
};
use tokio::task::JoinHandle;

const REDIRECT: &str = "https://app/cb";
const CONTENDERS: usize = 16;

fn server() -> Arc<AuthorizationServer> {
    let client = RegisteredClient::confidential("c1", "secret")
        .unwrap()
        .redirect_uri(REDIRECT)
        .scopes(["read", "write"]);
    let server = AuthorizationServer::builder()
        .config(AuthzConfig::default())
        .client_store(Arc::new(InMemoryClientStore::new(vec![client])))
        .build()
        .unwrap();
    Arc::new(server)
}

async fn issue_code(server: &AuthorizationServer) -> String {
    let request = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read write");
    match server.authorize(request).await.unwrap() {
        AuthorizeOutcome::Issued(response) => response.code,
        AuthorizeOutcome::ConsentRequired(pending) => {
            server
                .decide_consent(&pending.ticket, "alice", ConsentDecision::Grant { scopes: None })
                .await
                .unwrap()
                .code
        }
    }
}

/// Fires the same token request from many tasks and counts the winners.
async fn contend(server: &Arc<AuthorizationServer>, request: TokenRequest) -> usize {
    let handles: Vec<JoinHandle<Result<TokenResponse, OAuthError>>> = (0..CONTENDERS)
        .map(|_| {
            let server = server.clone();
            let request = request.clone();
            tokio::spawn(async move {
                server.exchange(request, &ClientCredentials::basic("c1", "secret")).await
            })
        })
        .collect();
    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(err) => assert_eq!(err, OAuthError::InvalidGrant),
        }
    }
    successes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_code_redemption_succeeds_once() {
    let server = server();
    for _ in 0..8 {
        let code = issue_code(&server).await;
        let request = TokenRequest::AuthorizationCode {
            code,
            redirect_uri: REDIRECT.to_string(),
            code_verifier: None,
        };
        assert_eq!(contend(&server, request).await, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_rotation_succeeds_once() {
    let server = server();
    let code = issue_code(&server).await;
    let tokens = server
        .exchange(
            TokenRequest::AuthorizationCode { code, redirect_uri: REDIRECT.to_string(), code_verifier: None },
            &ClientCredentials::basic("c1", "secret"),
        )
        .await
        .unwrap();
    let request = TokenRequest::RefreshToken { refresh_token: tokens.refresh_token.unwrap(), scope: None };
    assert_eq!(contend(&server, request.clone()).await, 1);
    // Reuse was detected, so nothing in the family survives
    assert_eq!(
        server.exchange(request, &ClientCredentials::basic("c1", "secret")).await.unwrap_err(),
        OAuthError::InvalidGrant
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consent_merges_lose_nothing() {
    let store = Arc::new(InMemoryConsentStore::new());
    let now = Utc::now();
    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let scopes = ScopeSet::parse(&format!("s{} shared", i)).unwrap();
                store.merge("alice", "c1", &scopes, now).await.unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    let record = store.get("alice", "c1").await.unwrap().unwrap();
    assert_eq!(record.scopes.len(), CONTENDERS + 1);
    assert!((0..CONTENDERS).all(|i| record.scopes.contains(&format!("s{}", i))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consent_through_server() {
    let server = server();
    let handles: Vec<_> = ["read", "write"]
        .into_iter()
        .map(|scope| {
            let server = server.clone();
            tokio::spawn(async move {
                let scopes = ScopeSet::parse(scope).unwrap();
                let now = server.clock().now();
                server.consent_tracker().record_consent("bob", "c1", &scopes, now).await.unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    let both = ScopeSet::parse("read write").unwrap();
    assert!(server.consent_tracker().has_consent("bob", "c1", &both).await.unwrap());
}

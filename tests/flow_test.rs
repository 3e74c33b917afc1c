use std::sync::Arc;
use chrono::Duration;
use starberry_authz::oauth_core::crypto::pkce_code_challenge;
use starberry_authz::{
    AuthorizationRequest, AuthorizationResponse, AuthorizationServer, AuthorizeOutcome, AuthzConfig,
    ClientAuthMethod, ClientCredentials, ConsentDecision, GrantType, InMemoryClientStore, ManualClock,
    OAuthError, RegisteredClient, ScopeSet, TokenRequest,
};

const REDIRECT: &str = "https://app/cb";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn c1() -> RegisteredClient {
    RegisteredClient::confidential("c1", "secret")
        .unwrap()
        .redirect_uri(REDIRECT)
        .scopes(["read", "write"])
}

fn creds() -> ClientCredentials {
    ClientCredentials::basic("c1", "secret")
}

fn server_with(clients: Vec<RegisteredClient>, config: AuthzConfig) -> (Arc<AuthorizationServer>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let server = AuthorizationServer::builder()
        .config(config)
        .clock(clock.clone())
        .client_store(Arc::new(InMemoryClientStore::new(clients)))
        .build()
        .unwrap();
    (Arc::new(server), clock)
}

fn server() -> (Arc<AuthorizationServer>, Arc<ManualClock>) {
    server_with(vec![c1()], AuthzConfig::default())
}

/// Runs the authorize step, approving every requested scope if asked.
async fn approve(server: &AuthorizationServer, request: AuthorizationRequest) -> AuthorizationResponse {
    match server.authorize(request).await.unwrap() {
        AuthorizeOutcome::Issued(response) => response,
        AuthorizeOutcome::ConsentRequired(pending) => server
            .decide_consent(&pending.ticket, &pending.subject, ConsentDecision::Grant { scopes: None })
            .await
            .unwrap(),
    }
}

fn redeem(code: &str) -> TokenRequest {
    TokenRequest::AuthorizationCode {
        code: code.to_string(),
        redirect_uri: REDIRECT.to_string(),
        code_verifier: None,
    }
}

fn refresh(token: &str) -> TokenRequest {
    TokenRequest::RefreshToken { refresh_token: token.to_string(), scope: None }
}

#[tokio::test]
async fn test_c1_write_scenario() {
    let (server, _) = server();
    let request = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("write").state("xyz");
    let pending = match server.authorize(request).await.unwrap() {
        AuthorizeOutcome::ConsentRequired(pending) => pending,
        other => panic!("expected consent prompt, got {:?}", other),
    };
    assert_eq!(pending.missing, ScopeSet::parse("write").unwrap());

    let response = server
        .decide_consent(&pending.ticket, "alice", ConsentDecision::Grant { scopes: None })
        .await
        .unwrap();
    let location = response.redirect_url().unwrap();
    assert!(location.starts_with("https://app/cb?code="));
    assert!(location.ends_with("&state=xyz"));

    let tokens = server.exchange(redeem(&response.code), &creds()).await.unwrap();
    assert_eq!(tokens.token_type, "Bearer");
    assert_eq!(tokens.expires_in, 300);
    assert_eq!(tokens.scope, "write");
    assert!(tokens.refresh_token.is_some());
    let claims = server.verify_access_token(&tokens.access_token, Some("c1")).await.unwrap();
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.scope, "write");

    // Redeeming X again fails and takes the first tokens down with it
    let err = server.exchange(redeem(&response.code), &creds()).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidGrant);
    assert_eq!(
        server.verify_access_token(&tokens.access_token, Some("c1")).await.unwrap_err(),
        OAuthError::InvalidGrant
    );
    let refresh_token = tokens.refresh_token.unwrap();
    assert_eq!(server.exchange(refresh(&refresh_token), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
}

#[tokio::test]
async fn test_unregistered_redirect_is_not_redirected_to() {
    let (server, _) = server();
    let request = AuthorizationRequest::new("c1", "https://evil/cb", "alice").scope("read").state("s");
    let err = server.authorize(request).await.unwrap_err();
    assert_eq!(err.error.error_code(), "invalid_request");
    assert!(err.error.error_description().starts_with("invalid_redirect_uri"));
    assert!(err.redirect.is_none());
    assert!(err.redirect_url().is_none());
}

#[tokio::test]
async fn test_unknown_client_and_missing_parameters() {
    let (server, _) = server();
    let err = server.authorize(AuthorizationRequest::new("nobody", REDIRECT, "alice")).await.unwrap_err();
    assert_eq!(err.error, OAuthError::InvalidClient);
    assert!(err.redirect.is_none());

    let err = server.authorize(AuthorizationRequest::new("", REDIRECT, "alice")).await.unwrap_err();
    assert_eq!(err.error.error_code(), "invalid_request");

    let mut request = AuthorizationRequest::new("c1", REDIRECT, "alice");
    request.response_type = "token".into();
    let err = server.authorize(request).await.unwrap_err();
    assert_eq!(err.error, OAuthError::UnsupportedResponseType);
    assert!(err.redirect.is_some());
}

#[tokio::test]
async fn test_scope_superset_is_rejected() {
    let (server, _) = server();
    let request = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read write admin").state("s1");
    let err = server.authorize(request).await.unwrap_err();
    assert_eq!(err.error, OAuthError::InvalidScope);
    let location = err.redirect_url().unwrap();
    assert!(location.contains("error=invalid_scope"));
    assert!(location.contains("state=s1"));
}

#[tokio::test]
async fn test_absent_scope_defaults_to_registered_scopes() {
    let (server, _) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice")).await;
    assert_eq!(response.scopes, ScopeSet::parse("read write").unwrap());
    let tokens = server.exchange(redeem(&response.code), &creds()).await.unwrap();
    assert_eq!(tokens.scope, "read write");
}

#[tokio::test]
async fn test_redemption_must_match_client_and_redirect() {
    let other = RegisteredClient::confidential("c2", "secret2")
        .unwrap()
        .redirect_uri(REDIRECT)
        .scopes(["read"]);
    let (server, _) = server_with(vec![c1().redirect_uri("https://app/other"), other], AuthzConfig::default());
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;

    let wrong_redirect = TokenRequest::AuthorizationCode {
        code: response.code.clone(),
        redirect_uri: "https://app/other".into(),
        code_verifier: None,
    };
    assert_eq!(server.exchange(wrong_redirect, &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
    let wrong_client = ClientCredentials::basic("c2", "secret2");
    assert_eq!(server.exchange(redeem(&response.code), &wrong_client).await.unwrap_err(), OAuthError::InvalidGrant);

    // A mismatched attempt does not burn the code for its owner
    assert!(server.exchange(redeem(&response.code), &creds()).await.is_ok());
}

#[tokio::test]
async fn test_code_ttl_boundary() {
    let (server, clock) = server_with(vec![c1()], AuthzConfig::default().with_code_ttl(120));

    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    clock.advance(Duration::seconds(119));
    assert!(server.exchange(redeem(&response.code), &creds()).await.is_ok());

    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    clock.advance(Duration::seconds(121));
    assert_eq!(server.exchange(redeem(&response.code), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
}

#[tokio::test]
async fn test_refresh_rotation_and_reuse_detection() {
    let (server, _) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read write")).await;
    let first = server.exchange(redeem(&response.code), &creds()).await.unwrap();
    let r1 = first.refresh_token.unwrap();

    let second = server.exchange(refresh(&r1), &creds()).await.unwrap();
    let r2 = second.refresh_token.unwrap();
    assert_ne!(r1, r2);
    assert_eq!(second.scope, "read write");

    // Reusing the rotated-away token fails and revokes its successor
    assert_eq!(server.exchange(refresh(&r1), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
    assert_eq!(server.exchange(refresh(&r2), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
}

#[tokio::test]
async fn test_code_replay_revokes_refreshed_access_tokens() {
    let (server, _) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let first = server.exchange(redeem(&response.code), &creds()).await.unwrap();
    let refreshed = server.exchange(refresh(&first.refresh_token.unwrap()), &creds()).await.unwrap();
    assert!(server.verify_access_token(&refreshed.access_token, Some("c1")).await.is_ok());

    assert_eq!(server.exchange(redeem(&response.code), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
    for token in [&first.access_token, &refreshed.access_token] {
        assert_eq!(
            server.verify_access_token(token, Some("c1")).await.unwrap_err(),
            OAuthError::InvalidGrant
        );
    }
    let latest = refreshed.refresh_token.unwrap();
    assert_eq!(server.exchange(refresh(&latest), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
}

#[tokio::test]
async fn test_refresh_reuse_revokes_refreshed_access_tokens() {
    let (server, _) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let r1 = server.exchange(redeem(&response.code), &creds()).await.unwrap().refresh_token.unwrap();
    let second = server.exchange(refresh(&r1), &creds()).await.unwrap();
    let third = server.exchange(refresh(&second.refresh_token.unwrap()), &creds()).await.unwrap();

    assert_eq!(server.exchange(refresh(&r1), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
    for token in [&second.access_token, &third.access_token] {
        assert_eq!(
            server.verify_access_token(token, Some("c1")).await.unwrap_err(),
            OAuthError::InvalidGrant
        );
    }
}

#[tokio::test]
async fn test_refresh_without_rotation_returns_same_token() {
    let (server, _) = server_with(vec![c1().rotate_refresh_tokens(false)], AuthzConfig::default());
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read write")).await;
    let r1 = server.exchange(redeem(&response.code), &creds()).await.unwrap().refresh_token.unwrap();

    for _ in 0..2 {
        let tokens = server.exchange(refresh(&r1), &creds()).await.unwrap();
        assert_eq!(tokens.refresh_token.as_deref(), Some(r1.as_str()));
    }
}

#[tokio::test]
async fn test_refresh_scope_must_stay_within_original_grant() {
    let (server, clock) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read write")).await;
    let r1 = server.exchange(redeem(&response.code), &creds()).await.unwrap().refresh_token.unwrap();

    let narrowed = TokenRequest::RefreshToken { refresh_token: r1.clone(), scope: Some("read".into()) };
    let tokens = server.exchange(narrowed, &creds()).await.unwrap();
    assert_eq!(tokens.scope, "read");
    let r2 = tokens.refresh_token.unwrap();

    // The rotated token still carries the full original grant
    let widened = TokenRequest::RefreshToken { refresh_token: r2.clone(), scope: Some("read admin".into()) };
    assert_eq!(server.exchange(widened, &creds()).await.unwrap_err(), OAuthError::InvalidScope);
    let tokens = server.exchange(refresh(&r2), &creds()).await.unwrap();
    assert_eq!(tokens.scope, "read write");

    clock.advance(Duration::days(31));
    let r3 = tokens.refresh_token.unwrap();
    assert_eq!(server.exchange(refresh(&r3), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
}

#[tokio::test]
async fn test_consent_is_remembered_and_extended() {
    let (server, _) = server();
    let first = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read write");
    let pending = match server.authorize(first.clone()).await.unwrap() {
        AuthorizeOutcome::ConsentRequired(pending) => pending,
        other => panic!("expected consent prompt, got {:?}", other),
    };
    // The owner only approves part of the request
    let response = server
        .decide_consent(
            &pending.ticket,
            "alice",
            ConsentDecision::Grant { scopes: Some(ScopeSet::parse("read").unwrap()) },
        )
        .await
        .unwrap();
    assert_eq!(response.scopes, ScopeSet::parse("read").unwrap());

    // Covered scopes skip the prompt
    let again = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read");
    assert!(matches!(server.authorize(again).await.unwrap(), AuthorizeOutcome::Issued(_)));

    // New scopes prompt only for what is missing
    match server.authorize(first).await.unwrap() {
        AuthorizeOutcome::ConsentRequired(pending) => {
            assert_eq!(pending.missing, ScopeSet::parse("write").unwrap());
            assert_eq!(pending.requested, ScopeSet::parse("read write").unwrap());
        }
        other => panic!("expected consent prompt, got {:?}", other),
    }

    // Consent is per resource owner
    let bob = AuthorizationRequest::new("c1", REDIRECT, "bob").scope("read");
    assert!(matches!(server.authorize(bob).await.unwrap(), AuthorizeOutcome::ConsentRequired(_)));

    assert!(server.revoke_consent("alice", "c1").await.unwrap());
    let revoked = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read");
    assert!(matches!(server.authorize(revoked).await.unwrap(), AuthorizeOutcome::ConsentRequired(_)));
}

#[tokio::test]
async fn test_consent_denied_and_invalid_decisions() {
    let (server, clock) = server();
    let request = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read").state("st");

    let AuthorizeOutcome::ConsentRequired(pending) = server.authorize(request.clone()).await.unwrap() else {
        panic!("expected consent prompt");
    };
    let err = server.decide_consent(&pending.ticket, "alice", ConsentDecision::Deny).await.unwrap_err();
    assert_eq!(err.error, OAuthError::AccessDenied);
    assert!(err.redirect_url().unwrap().contains("error=access_denied"));
    // A ticket is decided once
    let err = server
        .decide_consent(&pending.ticket, "alice", ConsentDecision::Grant { scopes: None })
        .await
        .unwrap_err();
    assert_eq!(err.error.error_code(), "invalid_request");
    assert!(err.redirect.is_none());

    // Another owner cannot decide, and does not spoil the ticket
    let AuthorizeOutcome::ConsentRequired(pending) = server.authorize(request.clone()).await.unwrap() else {
        panic!("expected consent prompt");
    };
    let err = server
        .decide_consent(&pending.ticket, "mallory", ConsentDecision::Grant { scopes: None })
        .await
        .unwrap_err();
    assert_eq!(err.error.error_code(), "invalid_request");
    let widened = ConsentDecision::Grant { scopes: Some(ScopeSet::parse("read write").unwrap()) };
    let err = server.decide_consent(&pending.ticket, "alice", widened).await.unwrap_err();
    assert_eq!(err.error, OAuthError::InvalidScope);

    // An expired prompt is a denial
    let AuthorizeOutcome::ConsentRequired(pending) = server.authorize(request).await.unwrap() else {
        panic!("expected consent prompt");
    };
    clock.advance(Duration::seconds(601));
    let err = server
        .decide_consent(&pending.ticket, "alice", ConsentDecision::Grant { scopes: None })
        .await
        .unwrap_err();
    assert_eq!(err.error, OAuthError::AccessDenied);
}

#[tokio::test]
async fn test_client_without_consent_requirement_gets_code_directly() {
    let (server, _) = server_with(vec![c1().require_consent(false)], AuthzConfig::default());
    let request = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read");
    assert!(matches!(server.authorize(request).await.unwrap(), AuthorizeOutcome::Issued(_)));
}

#[tokio::test]
async fn test_pkce_binding() {
    let (server, _) = server_with(vec![c1().require_pkce(true)], AuthzConfig::default());
    let err = server
        .authorize(AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read"))
        .await
        .unwrap_err();
    assert_eq!(err.error.error_code(), "invalid_request");

    let mut plain = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read").pkce_challenge(VERIFIER);
    plain.code_challenge_method = Some("plain".into());
    assert_eq!(server.authorize(plain).await.unwrap_err().error.error_code(), "invalid_request");

    let challenge = pkce_code_challenge(VERIFIER);
    let request = AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read").pkce_challenge(&challenge);
    let response = approve(&server, request.clone()).await;
    assert_eq!(server.exchange(redeem(&response.code), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);

    let response = approve(&server, request).await;
    let with_verifier = TokenRequest::AuthorizationCode {
        code: response.code,
        redirect_uri: REDIRECT.into(),
        code_verifier: Some(VERIFIER.into()),
    };
    assert!(server.exchange(with_verifier, &creds()).await.is_ok());
}

#[tokio::test]
async fn test_public_clients_are_opt_in() {
    let spa = RegisteredClient::public("spa").redirect_uri(REDIRECT).scopes(["read"]);
    let challenge = pkce_code_challenge(VERIFIER);
    let request = AuthorizationRequest::new("spa", REDIRECT, "alice").scope("read").pkce_challenge(&challenge);

    let (server, _) = server_with(vec![spa.clone()], AuthzConfig::default());
    let err = server.authorize(request.clone()).await.unwrap_err();
    assert_eq!(err.error, OAuthError::UnauthorizedClient);

    let (server, _) = server_with(vec![spa], AuthzConfig::default().with_public_clients(true));
    let response = approve(&server, request).await;
    let exchange = TokenRequest::AuthorizationCode {
        code: response.code,
        redirect_uri: REDIRECT.into(),
        code_verifier: Some(VERIFIER.into()),
    };
    let tokens = server.exchange(exchange, &ClientCredentials::public("spa")).await.unwrap();
    assert_eq!(tokens.scope, "read");
    assert!(server.metadata().token_endpoint_auth_methods_supported.contains(&"none".to_string()));
}

#[tokio::test]
async fn test_client_authentication_failures_look_alike() {
    let (server, _) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let attempts = [
        ClientCredentials::basic("c1", "wrong"),
        ClientCredentials::basic("ghost", "secret"),
        ClientCredentials::public("c1"),
    ];
    for credentials in attempts {
        let err = server.exchange(redeem(&response.code), &credentials).await.unwrap_err();
        assert_eq!(err, OAuthError::InvalidClient);
    }
    // The code survived the failed authentications
    assert!(server.exchange(redeem(&response.code), &creds()).await.is_ok());
}

#[tokio::test]
async fn test_registered_auth_method_is_enforced() {
    let post_client = RegisteredClient::confidential("c1", "secret")
        .unwrap()
        .auth_method(ClientAuthMethod::ClientSecretPost)
        .redirect_uri(REDIRECT)
        .scopes(["read"]);
    let (server, _) = server_with(vec![post_client], AuthzConfig::default());
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    assert_eq!(server.exchange(redeem(&response.code), &creds()).await.unwrap_err(), OAuthError::InvalidClient);
    let post = ClientCredentials::post("c1", "secret");
    assert!(server.exchange(redeem(&response.code), &post).await.is_ok());
}

#[tokio::test]
async fn test_grant_types_limit_refresh() {
    let (server, _) = server_with(
        vec![c1().grant_types([GrantType::AuthorizationCode])],
        AuthzConfig::default(),
    );
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let tokens = server.exchange(redeem(&response.code), &creds()).await.unwrap();
    assert!(tokens.refresh_token.is_none());
    assert_eq!(server.exchange(refresh("anything"), &creds()).await.unwrap_err(), OAuthError::UnauthorizedClient);
}

#[tokio::test]
async fn test_token_revocation() {
    let (server, _) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let tokens = server.exchange(redeem(&response.code), &creds()).await.unwrap();

    server.revoke(&creds(), &tokens.access_token, Some("access_token")).await.unwrap();
    assert_eq!(
        server.verify_access_token(&tokens.access_token, None).await.unwrap_err(),
        OAuthError::InvalidGrant
    );

    let refresh_token = tokens.refresh_token.unwrap();
    server.revoke(&creds(), &refresh_token, None).await.unwrap();
    assert_eq!(server.exchange(refresh(&refresh_token), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);

    // Unknown tokens are accepted silently
    server.revoke(&creds(), "not-a-token", None).await.unwrap();
    let err = server.revoke(&ClientCredentials::basic("c1", "bad"), "not-a-token", None).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidClient);
}

#[tokio::test]
async fn test_access_token_expiry_follows_the_clock() {
    let (server, clock) = server_with(vec![c1().access_token_ttl(Duration::seconds(60))], AuthzConfig::default());
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let tokens = server.exchange(redeem(&response.code), &creds()).await.unwrap();
    assert_eq!(tokens.expires_in, 60);
    clock.advance(Duration::seconds(59));
    assert!(server.verify_access_token(&tokens.access_token, Some("c1")).await.is_ok());
    clock.advance(Duration::seconds(1));
    assert!(server.verify_access_token(&tokens.access_token, Some("c1")).await.is_err());
}

#[tokio::test]
async fn test_sweep_reclaims_expired_state() {
    let (server, clock) = server();
    let response = approve(&server, AuthorizationRequest::new("c1", REDIRECT, "alice").scope("read")).await;
    let pending = server
        .authorize(AuthorizationRequest::new("c1", REDIRECT, "bob").scope("read"))
        .await
        .unwrap();
    assert!(matches!(pending, AuthorizeOutcome::ConsentRequired(_)));

    clock.advance(Duration::seconds(3601));
    let report = server.sweep_expired().await.unwrap();
    assert_eq!(report.codes, 1);
    assert_eq!(report.pending_consents, 1);
    assert_eq!(server.exchange(redeem(&response.code), &creds()).await.unwrap_err(), OAuthError::InvalidGrant);
    assert_eq!(server.sweep_expired().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_metadata_document() {
    let (server, _) = server_with(vec![], AuthzConfig::default().with_issuer("https://auth.example"));
    let metadata = server.metadata();
    assert_eq!(metadata.issuer, "https://auth.example");
    assert_eq!(metadata.token_endpoint, "https://auth.example/oauth/token");
    assert_eq!(metadata.jwks_uri, "https://auth.example/.well-known/jwks.json");
    assert_eq!(metadata.code_challenge_methods_supported, vec!["S256".to_string()]);
    assert!(!metadata.token_endpoint_auth_methods_supported.contains(&"none".to_string()));
}

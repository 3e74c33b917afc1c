//! Walks one client through the authorization code flow against an
//! in-memory server and prints every response.
//!
//! Usage: `authz-demo [config.json]`. Set `RUST_LOG=debug` for protocol logs.

use std::error::Error;
use std::sync::Arc;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use starberry_authz::{
    AuthorizationServer, AuthzConfig, Endpoints, HttpRequest, HttpResponse, InMemoryClientStore,
    RegisteredClient, spawn_configured_sweeper,
};
use tracing_subscriber::EnvFilter;
use url::Url;

const CLIENT_ID: &str = "c1";
const CLIENT_SECRET: &str = "c1-secret";
const REDIRECT_URI: &str = "https://app/cb";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let log_level = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = match std::env::args().nth(1) {
        Some(path) => AuthzConfig::from_file(path)?,
        None => AuthzConfig::default(),
    };
    let clients = InMemoryClientStore::default();
    clients.insert(
        RegisteredClient::confidential(CLIENT_ID, CLIENT_SECRET)?
            .redirect_uri(REDIRECT_URI)
            .scopes(["read", "write"]),
    );
    let server = Arc::new(
        AuthorizationServer::builder()
            .config(config)
            .client_store(Arc::new(clients))
            .build()?,
    );
    let endpoints = Endpoints::new(server.clone());
    let paths = server.config().clone();
    let sweeper = spawn_configured_sweeper(endpoints.clone());

    let authorize = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope=write&state=demo",
        paths.authorize_endpoint, CLIENT_ID, REDIRECT_URI
    );
    let prompt = endpoints.handle(&HttpRequest::get(authorize), Some("alice")).await;
    show("authorize", &prompt);
    let ticket = prompt
        .json_body()
        .and_then(|body| body["consent_ticket"].as_str().map(str::to_string))
        .ok_or("no consent prompt")?;

    let consent = HttpRequest::post_form(
        paths.authorize_endpoint.clone(),
        format!("consent_ticket={}&decision=approve", ticket),
    );
    let redirect = endpoints.handle(&consent, Some("alice")).await;
    show("consent", &redirect);
    let location = Url::parse(redirect.header("location").ok_or("no redirect")?)?;
    let code = location
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .ok_or("no code in redirect")?;

    let basic = format!("Basic {}", STANDARD.encode(format!("{}:{}", CLIENT_ID, CLIENT_SECRET)));
    let token_request = || {
        HttpRequest::post_form(
            paths.token_endpoint.clone(),
            format!("grant_type=authorization_code&code={}&redirect_uri={}", code, REDIRECT_URI),
        )
        .with_header("Authorization", basic.clone())
    };
    show("token", &endpoints.handle(&token_request(), None).await);
    show("token (replayed code)", &endpoints.handle(&token_request(), None).await);
    show("jwks", &endpoints.handle(&HttpRequest::get(paths.jwks_endpoint.clone()), None).await);

    sweeper.abort();
    let report = endpoints.sweep_expired().await?;
    println!("sweep: {:?}", report);
    Ok(())
}

fn show(step: &str, resp: &HttpResponse) {
    println!("== {} -> {}", step, resp.status);
    if let Some(location) = resp.header("location") {
        println!("Location: {}", location);
    }
    if !resp.body.is_empty() {
        println!("{}", String::from_utf8_lossy(&resp.body));
    }
}

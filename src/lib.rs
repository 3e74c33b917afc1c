pub mod oauth_core;

pub use oauth_core::clock::{Clock, ManualClock, SystemClock};
pub use oauth_core::config::{AuthzConfig, RateLimitConfig};
pub use oauth_core::consent::ConsentTracker;
pub use oauth_core::endpoint::{Endpoints, HttpRequest, HttpResponse};
pub use oauth_core::error::{ConfigError, ErrorKind, OAuthError};
pub use oauth_core::grant::{
    AuthorizationRequest, AuthorizationResponse, AuthorizationServer, AuthorizationServerBuilder,
    AuthorizeError, AuthorizeOutcome, ConsentDecision, PendingConsent, ServerMetadata, SweepReport,
    TokenRequest,
};
pub use oauth_core::jwks::{Jwk, JwkSet, KeyManager, SigningKey};
pub use oauth_core::jwt::{AccessTokenClaims, TokenIssuer};
pub use oauth_core::memory::{
    InMemoryClientStore, InMemoryCodeStore, InMemoryConsentStore, InMemoryRefreshTokenStore,
    InMemoryRevocationList,
};
pub use oauth_core::oauth_provider::{ClientStore, CodeStore, ConsentStore, RefreshTokenStore, RevocationList};
pub use oauth_core::rate_limiter::{InMemoryRateLimiter, RateLimiter};
pub use oauth_core::registry::{ClientCredentials, ClientRegistry};
pub use oauth_core::sweeper::{spawn_configured_sweeper, spawn_sweeper};
pub use oauth_core::types::{ClientAuthMethod, GrantType, RegisteredClient, ScopeSet, TokenResponse};

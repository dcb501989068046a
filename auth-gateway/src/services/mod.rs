//! Business logic: tokens, policy enforcement, identities and federation.

pub mod error;
pub mod federation;
pub mod identity;
pub mod jwt;
pub mod policy;
pub mod providers;
pub mod seed;
pub mod tokens;

pub use error::GatewayError;
pub use federation::{
    AuthorizationRedirect, CallbackParams, FederationFlow, FederationOutcome, FederationSettings,
};
pub use identity::{IdentityService, NewIdentity};
pub use jwt::JwtService;
pub use policy::{Decision, PolicyEnforcer, PolicySnapshot, PolicyStore};
pub use providers::{IdentityProvider, OAuth2Provider, OAuthProviderConfig, ProviderProfile};
pub use tokens::{TokenLifecycleManager, TokenPair, VerifiedToken};

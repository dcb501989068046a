//! Domain records owned by the gateway stores.

pub mod external_link;
pub mod handshake;
pub mod identity;
pub mod policy;
pub mod token_family;

pub use external_link::ExternalLink;
pub use handshake::HandshakeState;
pub use identity::{Identity, IdentityResponse, DEFAULT_ROLE};
pub use policy::{GroupingRule, PolicyRule};
pub use token_family::TokenFamily;

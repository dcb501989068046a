pub mod gate;

pub use gate::{
    authorize_middleware, bearer_auth_middleware, session_auth_middleware, AuthUser, Principal,
    RequestGate,
};

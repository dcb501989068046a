//! HTTP handlers.

pub mod health;
pub mod oauth;
pub mod policy;
pub mod token;

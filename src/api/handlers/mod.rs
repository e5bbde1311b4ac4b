//! Route handlers: session endpoints under `auth`, the protected context read, probes and
//! the public key set.

pub mod auth;
pub mod health;
pub mod jwks;
pub mod me;

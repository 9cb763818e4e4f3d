pub mod auth;

pub use auth::{AuthenticatedAgent, IdentityVerifier, JwtVerifier};

//! Bearer-token issuing and verification for stark.
//!
//! The auth provider is an external collaborator; the orchestrator core uses
//! it only through two operations: verify a bearer token into a principal,
//! and mint a short-lived pod-scoped token at deploy time. This crate
//! provides those seams ([`TokenVerifier`], [`TokenAuthority`]) backed by
//! HS256 JWTs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod token;

pub use error::{AuthError, Result};
pub use token::{
    AuthConfig, PodTokenPair, Principal, TokenAuthority, TokenVerifier, ValidatedClaims,
};

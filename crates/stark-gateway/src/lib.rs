//! HTTP and WebSocket gateway for the stark orchestrator.
//!
//! The gateway owns the transports: a REST admin surface for operators and
//! the CLI, and the long-lived agent session endpoint. Everything of
//! substance lives in `stark-control`; this crate authenticates requests,
//! shapes errors, and pumps frames.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::{GatewayState, SharedState};

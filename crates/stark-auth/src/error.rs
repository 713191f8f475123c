//! Error types for token verification and issuing.

use thiserror::Error;

/// A result type using `AuthError`.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur while issuing or verifying tokens.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token's expiry has passed.
    #[error("token expired")]
    TokenExpired,

    /// The token signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// The token was issued by a different issuer.
    #[error("invalid issuer")]
    InvalidIssuer,

    /// A required claim is missing.
    #[error("missing claim: {0}")]
    MissingClaim(String),

    /// The `sub` claim is not a valid identifier for its kind.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// The token is for a different principal kind than required.
    #[error("wrong principal kind: expected {expected}, got {got}")]
    WrongKind {
        /// The kind the caller required.
        expected: &'static str,
        /// The kind found in the token.
        got: &'static str,
    },

    /// The token is malformed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Key handling or encoding failed.
    #[error("internal auth error: {0}")]
    Internal(String),
}

impl From<AuthError> for stark_core::CoreError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err.to_string())
    }
}

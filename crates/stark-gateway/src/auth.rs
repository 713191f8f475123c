//! Request authentication extractor.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use stark_auth::{Principal, TokenVerifier};
use stark_store::Store;

use crate::error::ApiError;
use crate::state::SharedState;

/// An authenticated operator, extracted from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The operator identity from the token's subject.
    pub user: String,
}

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)
}

#[axum::async_trait]
impl<S: Store + 'static> FromRequestParts<SharedState<S>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState<S>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.tokens.verify(token).await?;
        match claims.principal {
            Principal::User(user) => Ok(Self { user }),
            other => Err(ApiError::Forbidden(format!(
                "{} tokens cannot call the admin surface",
                other.kind()
            ))),
        }
    }
}

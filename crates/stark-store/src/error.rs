//! Error types for the state store.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The named record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists.
    #[error("already exists: {0}")]
    Duplicate(String),

    /// The writer's record version no longer matches the stored one.
    ///
    /// The first concurrent writer won; reload and retry.
    #[error("stale write: expected version {expected}, stored version is {stored}")]
    Stale {
        /// Version the writer based its update on.
        expected: u64,
        /// Version currently in the store.
        stored: u64,
    },

    /// A record failed validation before write.
    #[error("invalid record: {0}")]
    Invalid(String),

    /// An unexpected storage failure.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<StoreError> for stark_core::CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Duplicate(what) => Self::Conflict(format!("already exists: {what}")),
            StoreError::Stale { expected, stored } => Self::Conflict(format!(
                "stale write: expected version {expected}, stored version is {stored}"
            )),
            StoreError::Invalid(what) => Self::Invalid(what),
            StoreError::Internal(what) => Self::Internal(what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stark_core::CoreError;

    #[test]
    fn stale_maps_to_conflict() {
        let err = StoreError::Stale {
            expected: 3,
            stored: 4,
        };
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::Conflict(_)));
        assert!(core.is_retriable());
    }

    #[test]
    fn not_found_maps_through() {
        let core: CoreError = StoreError::NotFound("pod x".into()).into();
        assert!(matches!(core, CoreError::NotFound(_)));
    }
}

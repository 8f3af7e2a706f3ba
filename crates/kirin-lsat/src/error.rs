use thiserror::Error;

/// Errors returned by LSAT operations.
#[derive(Debug, Error)]
pub enum LsatError {
    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("secret store error: {0}")]
    Store(#[from] StoreError),

    #[error("challenger error: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Errors returned by [`crate::secrets::SecretStore`] backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No key material exists for the requested root key id.
    #[error("root key not found")]
    NotFound,

    /// The backing store could not be reached or refused the request.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The store answered, but the stored value is not valid key material.
    #[error("corrupted key material: {0}")]
    Corrupted(String),
}

/// Errors returned by [`crate::challenger::Challenger`] backends.
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("payment backend unreachable: {0}")]
    Unreachable(String),

    #[error("payment backend rejected request: {0}")]
    Rejected(String),

    #[error("invalid payment backend response: {0}")]
    InvalidResponse(String),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    /// Deliberately carries no detail: unknown email, wrong password, bad
    /// signature, expired token and revoked session all look the same.
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

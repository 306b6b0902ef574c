// src/error.rs
//! Error types shared by the store, the protocol backends and both gateways.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The repository directory does not exist.
    #[error("repository not found: {0}")]
    NotFound(String),

    /// The requested repository path is malformed or not allowed.
    #[error("invalid repo")]
    InvalidRepo,

    /// Wire framing violation or an unexpectedly closed stream.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("repository error: {0}")]
    Repository(String),

    /// Subprocess or filesystem failure on our side.
    #[error("system error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl Error {
    /// Client-caused errors can be shown verbatim; anything else is logged
    /// and reported generically.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::InvalidRepo)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

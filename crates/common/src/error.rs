//! Error types for WgKeeper

use thiserror::Error;

/// Result type alias using WgKeeper Error
pub type Result<T> = std::result::Result<T, Error>;

/// WgKeeper error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid peer name: {0:?}")]
    InvalidName(String),

    #[error("No free address left in {subnet}")]
    AddressPoolExhausted { subnet: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(kind: &str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// True for lookups and deletes of something that is not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True when a create collided with an existing peer
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

//! Error types for pgmon

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Input Errors ===
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unknown or decommissioned node: {0}")]
    UnknownNode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Committed map corrupted: {0}")]
    MapCorrupted(String),

    // === Encoding Errors ===
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Service Errors ===
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("HTTP error: {0}")]
    Http(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_) | Error::Consensus(_) | Error::ShuttingDown
        )
    }

    /// Rejections are resolved at the input boundary and never reach a delta
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Malformed(_) | Error::UnknownNode(_) | Error::InvalidConfig(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Malformed(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::UnknownNode(_) => StatusCode::FORBIDDEN,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::ShuttingDown | Error::Consensus(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

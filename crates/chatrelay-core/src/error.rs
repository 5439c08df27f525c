//! Error types for chatrelay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// No app is registered under the requested app code.
    #[error("App config not found: {0}")]
    ConfigNotFound(String),

    /// A single upstream line could not be decoded. Recovered per line.
    #[error("Upstream parse error: {0}")]
    UpstreamParse(String),

    /// Connection-level failure talking to an upstream provider.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream answered with a non-success HTTP status.
    #[error("Upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error ends an upstream chunk stream.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::UpstreamStatus { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

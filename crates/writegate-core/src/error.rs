//! Shared error types.
//!
//! Every coordinator returns its own typed outcome; the only error that
//! crosses coordinator boundaries unchanged is [`StoreError`], the generic
//! infrastructure failure.

use thiserror::Error;

/// Infrastructure failure talking to the durable store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value violates an invariant the schema cannot express.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Coarse classification used to map errors onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Permanent; the same request will fail the same way.
    Client,
    /// Transient; the whole request may be retried later with the same key.
    Contention,
    /// Fatal to the current request; logged and surfaced as a server error.
    Infrastructure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Contention => "contention",
            Self::Infrastructure => "infrastructure",
        }
    }
}

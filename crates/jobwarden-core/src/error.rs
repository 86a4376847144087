//! Error types shared by every jobwarden crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    /// Store access failed (connection, transaction, schema).
    #[error("Store error: {0}")]
    Store(String),

    /// Change channel failed or was used after close.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("Invalid stop mode: {0}")]
    InvalidStopMode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;

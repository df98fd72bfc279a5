// src/error.rs

//! Unified error handling for the harvester.

use std::fmt;

use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A caller broke a documented contract (wrong source tag length, short key, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A storage backend connection failed
    #[error("Connection error on {backend}: {message}")]
    Connection { backend: String, message: String },

    /// A storage call ran past its policy timeout
    #[error("Timeout on {backend}")]
    Timeout { backend: String },

    /// A batch write stopped after storing only its first `written` rows
    #[error("Partial write on {backend}: {written} rows stored before {message}")]
    PartialWrite {
        backend: String,
        written: usize,
        message: String,
    },

    /// A create-only write hit an existing record
    #[error("Record already exists: {key}")]
    RecordExists { key: String },

    /// Ingestion source failure
    #[error("Ingest error for {context}: {message}")]
    Ingest { context: String, message: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a connection error for a named backend.
    pub fn connection(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Create an ingestion source error with context.
    pub fn ingest(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Ingest {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

// src/error.rs

//! Unified error handling for the poller application.

use std::fmt;

use thiserror::Error;

/// Result type alias for poller operations.
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

    /// YAML parsing failed
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request could not be built (malformed URL, bad target)
    #[error("Request creation failed: {0}")]
    RequestCreation(String),

    /// Transport-level failure after retries were exhausted
    #[error("Request failed after {retries} retries: {message}")]
    RequestFailed { retries: u32, message: String },

    /// Response body could not be read or decoded
    #[error("Body read failed: {0}")]
    BodyRead(String),

    /// Per-request deadline expired
    #[error("request timeout")]
    RequestTimeout,

    /// Proxy demanded credentials we do not have, or rejected ours
    #[error("proxy authentication failed for {proxy}")]
    ProxyAuth { proxy: String },

    /// Proxy refused the tunnel
    #[error("proxy connection forbidden for {proxy}")]
    ProxyForbidden { proxy: String },

    /// Proxy CONNECT failed with an unexpected status
    #[error("proxy CONNECT failed with status {status}")]
    ProxyConnect { status: u16 },

    /// Upstream payload could not be interpreted
    #[error("Parse error for {context}: {message}")]
    Parse { context: String, message: String },

    /// The poller was started a second time
    #[error("already polling")]
    AlreadyPolling,

    /// The fetcher was started a second time
    #[error("already streaming")]
    AlreadyStreaming,

    /// No proxies were provided
    #[error("no proxies were provided")]
    NoProxies,

    /// The pool cannot sustain the target rate
    #[error("expected at least {expected} proxy groups, got {actual}")]
    InsufficientProxies { expected: usize, actual: usize },

    /// The work schedule has no entries
    #[error("no work session found")]
    NoWorkSession,

    /// Broadcast follower is not registered
    #[error("follower not found")]
    FollowerNotFound,

    /// Broadcast already closed
    #[error("broadcast closed")]
    BroadcastClosed,
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

    /// Create a parse error with context.
    pub fn parse(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a body-read error.
    pub fn body_read(message: impl fmt::Display) -> Self {
        Self::BodyRead(message.to_string())
    }
}

//! Error types for the analysis stream consumer
//!
//! Everything here terminates at the session boundary: callers only ever see
//! the `Display` string of these errors in `SessionState::error`.

use thiserror::Error;

/// Failures talking to the analysis endpoints
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level failure (connect, TLS, reset mid-body)
    #[error("Network error: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success status that is not a fallback trigger
    #[error("Request failed with status {status}")]
    Status { status: u16 },

    /// Successful status with nothing to read
    #[error("Response carried no readable body")]
    MissingBody,

    /// Fallback endpoint answered with something that is not the expected JSON
    #[error("Invalid response body: {0}")]
    Decode(String),
}

/// Failures turning one decoded frame into a typed event
///
/// These never abort a session; the parser logs them and drops the frame.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("malformed JSON in '{event}' frame: {message}")]
    MalformedJson { event: String, message: String },

    #[error("'{event}' payload does not match its shape: {message}")]
    Shape { event: String, message: String },
}

/// Configuration problems, reported before any session starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid endpoint path '{path}': {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

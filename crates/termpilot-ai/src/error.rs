//! Error types for termpilot-ai

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Result type alias using termpilot-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// How many `source()` hops to follow when classifying a network fault
const MAX_CAUSE_DEPTH: usize = 5;

/// Lowercased signatures of transient network faults, matched against every
/// message in the cause chain.
const NETWORK_FAULT_SIGNATURES: &[&str] = &[
    "fetch failed",
    "econnreset",
    "econnrefused",
    "econnaborted",
    "etimedout",
    "enotfound",
    "eai_again",
    "epipe",
    "connection reset",
    "connection refused",
    "connection closed before message completed",
    "dns error",
    "failed to lookup address",
    "timed out",
    "handshake",
];

/// Errors that can occur when talking to a chat completions endpoint
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Low-level I/O failure on the response body
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// API returned an error object
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Request was cancelled
    #[error("Request aborted")]
    Aborted,

    /// Provider settings are incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The provider needs an API key and none was configured
    #[error("No API key configured for {0}")]
    MissingApiKey(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable: transient network faults, HTTP 429
    /// and 5xx. Cancellation and configuration errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Error::Http(e) => is_network_fault(e),
            Error::Io(e) => is_network_fault(e),
            _ => false,
        }
    }

    /// Whether this is a configuration problem rather than a request failure
    pub fn is_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::MissingApiKey(_))
    }
}

/// Walk the cause chain (bounded) looking for a transient network fault.
pub fn is_network_fault(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    let mut depth = 0;

    while let Some(e) = current {
        if depth > MAX_CAUSE_DEPTH {
            break;
        }
        if is_fault_at(e) {
            return true;
        }
        // io::Error::source() skips the wrapped error itself, so look inside.
        if let Some(inner) = e.downcast_ref::<io::Error>().and_then(|io| io.get_ref()) {
            if is_fault_at(inner) {
                return true;
            }
        }
        current = e.source();
        depth += 1;
    }
    false
}

fn is_fault_at(e: &(dyn StdError + 'static)) -> bool {
    if let Some(io) = e.downcast_ref::<io::Error>() {
        if matches!(
            io.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::UnexpectedEof
        ) {
            return true;
        }
    }
    if let Some(req) = e.downcast_ref::<reqwest::Error>() {
        if req.is_timeout() || req.is_connect() {
            return true;
        }
    }
    let text = e.to_string().to_lowercase();
    NETWORK_FAULT_SIGNATURES.iter().any(|sig| text.contains(sig))
}

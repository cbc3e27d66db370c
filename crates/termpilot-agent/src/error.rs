//! Error types for termpilot-agent

use thiserror::Error;

/// Result type alias using termpilot-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the chat client layer
    #[error(transparent)]
    Ai(#[from] termpilot_ai::Error),

    /// A run was requested while another one is in progress
    #[error("An agent run is already in progress")]
    AlreadyRunning,

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

//! termpilot-ai: streaming client for OpenAI-compatible chat completions
//!
//! Resolves provider presets into concrete endpoints, decodes SSE bodies into
//! [`StreamEvent`]s and retries transient failures.

pub mod error;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use provider::{Endpoint, Provider, ProviderSettings};
pub use providers::openai::{Completion, OpenAiClient};
pub use providers::{ChatBackend, HttpBackend};
pub use retry::RetryPolicy;
pub use stream::{ChatEventStream, SseDecoder, StreamEvent};
pub use types::*;

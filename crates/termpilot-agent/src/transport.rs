//! Transport abstraction for running agents

use termpilot_ai::{ChatEventStream, Message, OpenAiClient, ProviderSettings, ToolDefinition};
use tokio_util::sync::CancellationToken;

/// Produces one streamed completion per agent turn
pub trait Transport: Send + Sync {
    /// Start streaming a completion for `messages`. The returned stream ends
    /// with `Finished` or `Error`, or silently on cancellation.
    fn stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        cancel: CancellationToken,
    ) -> ChatEventStream;
}

/// Direct provider transport - calls the configured endpoint
pub struct ProviderTransport {
    client: OpenAiClient,
    settings: ProviderSettings,
}

impl ProviderTransport {
    /// Create a new provider transport
    pub fn new(client: OpenAiClient, settings: ProviderSettings) -> Self {
        Self { client, settings }
    }
}

impl Transport for ProviderTransport {
    fn stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        cancel: CancellationToken,
    ) -> ChatEventStream {
        self.client
            .stream_with_tools(&self.settings, messages, tools, cancel)
    }
}

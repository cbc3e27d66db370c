//! Streaming event types and the SSE decoder

use std::collections::BTreeMap;
use std::pin::Pin;

use serde::Deserialize;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::types::{TokensSummary, ToolCallRequest};

/// Events emitted while streaming one chat completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant text delta
    Content(String),
    /// Reasoning delta from models that expose it
    Thought(String),
    /// A complete tool call, emitted when the response finishes
    ToolCall(ToolCallRequest),
    /// Token usage reported by the endpoint
    Usage(TokensSummary),
    /// The request failed transiently and is being retried
    Retry { attempt: u32, max: u32 },
    /// Terminal failure; nothing follows
    Error(String),
    /// The response completed
    Finished,
}

impl StreamEvent {
    /// Check if this is a terminal event (Finished or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finished | StreamEvent::Error(_))
    }
}

/// A stream of chat events
pub type ChatEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Incremental decoder for `text/event-stream` chat completion bodies.
///
/// Bytes are buffered until a full line is available, so chunk boundaries
/// (including ones that split a UTF-8 sequence) never change the result.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    tool_calls: ToolCallAccumulator,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line, &mut events);
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// The transport closed. Decodes any unterminated last line, then flushes
    /// pending tool calls and finishes if no terminator was seen.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(&line, &mut events);
        }
        if !self.done {
            self.complete(&mut events);
        }
        events
    }

    fn handle_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\n', '\r']);

        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.complete(events);
            return;
        }

        let chunk: WireChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable SSE line");
                return;
            }
        };

        if let Some(error) = chunk.error {
            events.push(StreamEvent::Error(error_message(&error)));
            self.done = true;
            return;
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(text) = delta.reasoning_content.or(delta.reasoning) {
                if !text.is_empty() {
                    events.push(StreamEvent::Thought(text));
                }
            }
            if let Some(text) = delta.content {
                if !text.is_empty() {
                    events.push(StreamEvent::Content(text));
                }
            }
            for fragment in delta.tool_calls.unwrap_or_default() {
                self.tool_calls.merge(fragment);
            }
        }

        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage(usage.into_summary()));
        }
    }

    fn complete(&mut self, events: &mut Vec<StreamEvent>) {
        events.extend(self.tool_calls.drain().into_iter().map(StreamEvent::ToolCall));
        events.push(StreamEvent::Finished);
        self.done = true;
    }
}

fn error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

/// Tool call fragments keyed by their per-response index
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn merge(&mut self, fragment: WireToolCall) {
        let entry = self.calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id {
            if entry.id.is_empty() && !id.is_empty() {
                entry.id = id;
            }
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                entry.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }

    fn drain(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| {
                let id = if call.id.is_empty() {
                    format!("call_{}", Uuid::new_v4().simple())
                } else {
                    call.id
                };
                ToolCallRequest::new(id, call.name, call.arguments)
            })
            .collect()
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<WireFunction>,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Usage object shared by streaming and non-streaming responses
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl WireUsage {
    pub(crate) fn into_summary(self) -> TokensSummary {
        let total = if self.total_tokens == 0 {
            self.prompt_tokens + self.completion_tokens
        } else {
            self.total_tokens
        };
        TokensSummary {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            cached_tokens: self
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            total_tokens: total,
        }
    }
}

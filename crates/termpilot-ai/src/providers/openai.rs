//! OpenAI-compatible Chat Completions client

use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ChatBackend, HttpBackend};
use crate::{
    error::{Error, Result},
    provider::{Endpoint, ProviderSettings},
    retry::RetryPolicy,
    stream::{ChatEventStream, SseDecoder, StreamEvent, WireUsage},
    types::{Message, TokensSummary, ToolCallRequest, ToolDefinition},
};

/// A non-streaming completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message: Message,
    pub usage: TokensSummary,
}

/// Chat completions client with retries
#[derive(Clone)]
pub struct OpenAiClient {
    backend: Arc<dyn ChatBackend>,
    retry: RetryPolicy,
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiClient {
    /// Create a client over HTTP with the default retry policy
    pub fn new() -> Self {
        Self::with_backend(Arc::new(HttpBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stream one completion. The stream never fails: configuration problems
    /// and exhausted retries end it with a single `Error` event, and
    /// cancellation ends it with no event at all.
    pub fn stream_with_tools(
        &self,
        settings: &ProviderSettings,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        cancel: CancellationToken,
    ) -> ChatEventStream {
        let backend = self.backend.clone();
        let retry = self.retry;
        let endpoint = settings.resolve();

        Box::pin(stream! {
            let endpoint = match endpoint {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!(error = %e, "provider settings rejected");
                    yield StreamEvent::Error(e.to_string());
                    return;
                }
            };
            let body = request_body(&endpoint, &messages, &tools, true);
            let mut attempt = 1;

            loop {
                tracing::debug!(url = %endpoint.url, model = %endpoint.model, attempt, "sending chat request");
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = backend.send(&endpoint, &body) => sent,
                };

                let mut yielded = false;
                let failure = match sent {
                    Err(e) => e,
                    Ok(mut bytes) => {
                        let mut decoder = SseDecoder::new();
                        loop {
                            let chunk = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return,
                                chunk = bytes.next() => chunk,
                            };
                            match chunk {
                                Some(Ok(data)) => {
                                    for event in decoder.push(&data) {
                                        yielded = true;
                                        let terminal = event.is_terminal();
                                        yield event;
                                        if terminal {
                                            return;
                                        }
                                    }
                                }
                                Some(Err(e)) => break e,
                                None => {
                                    for event in decoder.finish() {
                                        yield event;
                                    }
                                    return;
                                }
                            }
                        }
                    }
                };

                if !yielded && failure.is_retryable() && retry.should_retry(attempt) {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "chat request failed, retrying"
                    );
                    attempt += 1;
                    yield StreamEvent::Retry { attempt, max: retry.max_attempts };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }

                tracing::warn!(attempt, error = %failure, "chat request failed");
                yield StreamEvent::Error(failure.to_string());
                return;
            }
        })
    }

    /// One non-streaming completion under the same retry policy
    pub async fn complete(
        &self,
        settings: &ProviderSettings,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        let endpoint = settings.resolve()?;
        let body = request_body(&endpoint, &messages, &[], false);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Aborted),
                result = self.fetch_json(&endpoint, &body) => result,
            };
            match result {
                Ok(value) => return parse_completion(value),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(attempt, error = %e, "completion failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_json(
        &self,
        endpoint: &Endpoint,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut bytes = self.backend.send(endpoint, body).await?;
        let mut raw = Vec::new();
        while let Some(chunk) = bytes.next().await {
            raw.extend_from_slice(&chunk?);
        }
        Ok(serde_json::from_slice(&raw)?)
    }
}

fn request_body(
    endpoint: &Endpoint,
    messages: &[Message],
    tools: &[ToolDefinition],
    stream: bool,
) -> serde_json::Value {
    let mut body = json!({
        "model": endpoint.model,
        "messages": messages,
        "max_tokens": endpoint.max_tokens,
        "temperature": endpoint.temperature,
    });

    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }

    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body["tool_choice"] = json!("auto");
    }

    body
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    #[serde(default)]
    choices: Vec<WireCompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireCompletionChoice {
    message: WireCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct WireCompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallRequest>>,
}

fn parse_completion(value: serde_json::Value) -> Result<Completion> {
    let completion: WireCompletion = serde_json::from_value(value)?;

    if let Some(error) = completion.error {
        let error_type = error
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("error")
            .to_string();
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(Error::api(error_type, message));
    }

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::UnexpectedResponse("response has no choices".to_string()))?;

    let message = match choice.message.tool_calls {
        Some(calls) if !calls.is_empty() => {
            Message::assistant_tool_calls(choice.message.content, calls)
        }
        _ => Message::assistant(choice.message.content.unwrap_or_default()),
    };

    Ok(Completion {
        message,
        usage: completion
            .usage
            .map(WireUsage::into_summary)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::provider::Provider;
    use crate::providers::ByteStream;

    #[derive(Clone)]
    enum Reply {
        Status(u16),
        Reset,
        Body(Vec<&'static str>),
        BodyThenReset(Vec<&'static str>),
    }

    struct ScriptedBackend {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicU32,
        last_body: Mutex<Option<serde_json::Value>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
                last_body: Mutex::new(None),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn chunks(parts: Vec<&'static str>) -> Vec<Result<Vec<u8>>> {
        parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn send(&self, _endpoint: &Endpoint, body: &serde_json::Value) -> Result<ByteStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_body.lock().unwrap() = Some(body.clone());
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 {
                    replies.pop_front().unwrap()
                } else {
                    replies.front().cloned().unwrap()
                }
            };
            match reply {
                Reply::Status(status) => Err(Error::Status {
                    status,
                    body: "{}".into(),
                }),
                Reply::Reset => Err(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset))),
                Reply::Body(parts) => Ok(Box::pin(futures::stream::iter(chunks(parts)))),
                Reply::BodyThenReset(parts) => {
                    let mut items = chunks(parts);
                    items.push(Err(Error::Io(io::Error::from(
                        io::ErrorKind::ConnectionReset,
                    ))));
                    Ok(Box::pin(futures::stream::iter(items)))
                }
            }
        }
    }

    const HI: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

    fn settings() -> ProviderSettings {
        ProviderSettings::new(Provider::OpenAI).with_api_key("sk-test")
    }

    async fn collect(client: &OpenAiClient, settings: &ProviderSettings) -> Vec<StreamEvent> {
        client
            .stream_with_tools(settings, vec![Message::user("hello")], vec![], CancellationToken::new())
            .collect()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_with_linear_delay() {
        let backend = ScriptedBackend::new(vec![Reply::Status(429)]);
        let client = OpenAiClient::with_backend(backend.clone());

        let started = tokio::time::Instant::now();
        let events = collect(&client, &settings()).await;
        let elapsed = started.elapsed();

        assert_eq!(backend.calls(), 3);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Retry { attempt: 2, max: 3 });
        assert_eq!(events[1], StreamEvent::Retry { attempt: 3, max: 3 });
        assert!(matches!(&events[2], StreamEvent::Error(msg) if msg.contains("429")));
        // 500ms before attempt 2, 1000ms before attempt 3
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retry() {
        for status in [500u16, 502, 503, 504] {
            let backend = ScriptedBackend::new(vec![Reply::Status(status)]);
            let client = OpenAiClient::with_backend(backend.clone());
            let events = collect(&client, &settings()).await;
            assert_eq!(backend.calls(), 3, "status {status}");
            assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        for status in [400u16, 401, 403, 404] {
            let backend = ScriptedBackend::new(vec![Reply::Status(status)]);
            let client = OpenAiClient::with_backend(backend.clone());
            let events = collect(&client, &settings()).await;
            assert_eq!(backend.calls(), 1, "status {status}");
            assert_eq!(events.len(), 1);
            assert!(matches!(&events[0], StreamEvent::Error(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let backend = ScriptedBackend::new(vec![Reply::Reset, Reply::Body(vec![HI])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let events = collect(&client, &settings()).await;
        assert_eq!(backend.calls(), 2);
        assert_eq!(
            events,
            vec![
                StreamEvent::Retry { attempt: 2, max: 3 },
                StreamEvent::Content("Hi".into()),
                StreamEvent::Finished,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_output_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Reply::BodyThenReset(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n",
        ])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let events = collect(&client, &settings()).await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(events[0], StreamEvent::Content("par".into()));
        assert!(matches!(&events[1], StreamEvent::Error(_)));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ends_at_terminator() {
        let backend = ScriptedBackend::new(vec![Reply::BodyThenReset(vec![HI])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let events = collect(&client, &settings()).await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(
            events,
            vec![StreamEvent::Content("Hi".into()), StreamEvent::Finished]
        );
    }

    #[tokio::test]
    async fn test_missing_key_makes_no_request() {
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![HI])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let events = collect(&client, &ProviderSettings::new(Provider::OpenAI)).await;
        assert_eq!(backend.calls(), 0);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(msg) if msg.contains("API key")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_yields_nothing() {
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![HI])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<_> = client
            .stream_with_tools(&settings(), vec![Message::user("x")], vec![], cancel)
            .collect()
            .await;
        assert!(events.is_empty());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_ends_stream_silently() {
        let backend = ScriptedBackend::new(vec![Reply::Status(503)]);
        let client = OpenAiClient::with_backend(backend.clone());
        let cancel = CancellationToken::new();
        let mut stream =
            client.stream_with_tools(&settings(), vec![Message::user("x")], vec![], cancel.clone());

        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Retry { attempt: 2, max: 3 })
        );
        cancel.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_request_body_shape() {
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![HI])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let tools = vec![ToolDefinition::new(
            "list_directory",
            "List a directory",
            json!({"type": "object", "properties": {}}),
        )];
        let _: Vec<_> = client
            .stream_with_tools(&settings(), vec![Message::user("hi")], tools, CancellationToken::new())
            .collect()
            .await;

        let body = backend.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "list_directory");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_complete_parses_message_and_usage() {
        let backend = ScriptedBackend::new(vec![Reply::Body(vec![
            r#"{"choices":[{"message":{"role":"assistant","content":"pong"}}],"#,
            r#""usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#,
        ])]);
        let client = OpenAiClient::with_backend(backend.clone());
        let completion = client
            .complete(&settings(), vec![Message::user("ping")], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.message, Message::assistant("pong"));
        assert_eq!(completion.usage.total_tokens, 6);
        let body = backend.last_body.lock().unwrap().clone().unwrap();
        assert!(body.get("stream").is_none());
        assert!(body.get("tools").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_gives_up_after_budget() {
        let backend = ScriptedBackend::new(vec![Reply::Status(500)]);
        let client = OpenAiClient::with_backend(backend.clone());
        let err = client
            .complete(&settings(), vec![Message::user("ping")], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status { status: 500, .. }));
        assert_eq!(backend.calls(), 3);
    }
}

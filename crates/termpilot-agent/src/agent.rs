//! Agent execution loop

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use termpilot_ai::{Message, StreamEvent, TokensSummary, ToolCallRequest};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    conversation,
    error::{Error, Result},
    events::{AgentEvent, RunOutcome},
    handle::{AgentHandle, RunGuard},
    tool::{ToolResult, Toolbox},
    transport::Transport,
};

/// Shown to the user when a run is cancelled
pub const ABORTED_NOTICE: &str = "\n[request cancelled]\n";

/// Agent configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConfig {
    /// Maximum model turns per run
    pub max_turns: u32,
    /// Message count that triggers trimming before a turn
    pub max_messages: usize,
    /// Messages kept after the pinned system message when trimming
    pub keep_recent: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_messages: 50,
            keep_recent: 40,
        }
    }
}

/// What a run produced
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    /// Only the messages appended during this run
    pub messages: Vec<Message>,
    pub usage: TokensSummary,
    pub outcome: RunOutcome,
}

/// The main agent that orchestrates tool-calling turns
pub struct Agent {
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    toolbox: Arc<dyn Toolbox>,
    event_tx: broadcast::Sender<AgentEvent>,
    handle: AgentHandle,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
    tool_names: HashSet<String>,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        toolbox: Arc<dyn Toolbox>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let mut schema_cache = HashMap::new();
        let mut tool_names = HashSet::new();
        for definition in toolbox.definitions() {
            match jsonschema::validator_for(&definition.parameters) {
                Ok(validator) => {
                    schema_cache.insert(definition.name.clone(), Arc::new(validator));
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid tool parameter schema for '{}', skipping validation: {}",
                        definition.name,
                        e
                    );
                }
            }
            tool_names.insert(definition.name);
        }

        Self {
            config,
            transport,
            toolbox,
            event_tx,
            handle: AgentHandle::new(),
            schema_cache,
            tool_names,
        }
    }

    /// Subscribe to agent events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Get the agent config
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Get a cloneable handle for poking the agent from external code.
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Whether the agent loop is currently running.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run turns until the model stops calling tools, the turn budget runs
    /// out, the endpoint fails or `cancel` fires.
    ///
    /// Only a concurrent run is an error; every other ending is reported
    /// through [`AgentResult::outcome`].
    pub async fn run(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<AgentResult> {
        if !self.handle.begin(cancel.clone()) {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunGuard(&self.handle);

        tracing::info!(messages = messages.len(), "agent run started");
        self.emit(AgentEvent::AgentStart);

        let tools = self.toolbox.definitions();
        let mut context = messages;
        let mut produced: Vec<Message> = Vec::new();
        let mut usage = TokensSummary::default();
        let mut turn = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Aborted;
            }
            if turn >= self.config.max_turns {
                tracing::debug!(turn, "turn budget exhausted");
                break RunOutcome::Completed;
            }
            turn += 1;
            self.emit(AgentEvent::TurnStart { turn_number: turn });

            conversation::trim(
                &mut context,
                self.config.max_messages,
                self.config.keep_recent,
            );

            let mut stream = self
                .transport
                .stream(context.clone(), tools.clone(), cancel.clone());

            let mut text = String::new();
            let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
            let mut failure: Option<String> = None;
            let mut cancelled = false;

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    event = stream.next() => event,
                };
                let Some(event) = event else { break };

                match event {
                    StreamEvent::Content(delta) => {
                        text.push_str(&delta);
                        self.emit(AgentEvent::Content { text: delta });
                    }
                    StreamEvent::Thought(delta) => {
                        self.emit(AgentEvent::Thought { text: delta });
                    }
                    StreamEvent::Retry { attempt, max } => {
                        self.emit(AgentEvent::Retry { attempt, max });
                    }
                    StreamEvent::ToolCall(call) => tool_calls.push(call),
                    StreamEvent::Usage(turn_usage) => usage.add(&turn_usage),
                    StreamEvent::Error(message) => {
                        failure = Some(message);
                        break;
                    }
                    StreamEvent::Finished => break,
                }
            }

            if cancelled {
                break RunOutcome::Aborted;
            }
            if let Some(message) = failure {
                tracing::warn!(error = %message, turn, "agent turn failed");
                self.emit(AgentEvent::Error {
                    message: message.clone(),
                });
                break RunOutcome::Failed(message);
            }

            if tool_calls.is_empty() {
                if !text.is_empty() {
                    let reply = Message::assistant(text);
                    context.push(reply.clone());
                    produced.push(reply);
                }
                break RunOutcome::Completed;
            }

            let content = if text.is_empty() { None } else { Some(text) };
            let request = Message::assistant_tool_calls(content, tool_calls.clone());
            context.push(request.clone());
            produced.push(request);

            for call in &tool_calls {
                let result = if cancel.is_cancelled() {
                    ToolResult::error("Cancelled before execution")
                } else {
                    self.emit(AgentEvent::ToolExecutionStart {
                        tool_call_id: call.id.clone(),
                        tool_name: call.function.name.clone(),
                        arguments: call.function.arguments.clone(),
                    });
                    let result = self.execute_call(call, &cancel).await;
                    self.emit(AgentEvent::ToolExecutionEnd {
                        tool_call_id: call.id.clone(),
                        tool_name: call.function.name.clone(),
                        result: result.content.clone(),
                        is_error: result.is_error,
                    });
                    result
                };
                let message = Message::tool_result(&call.id, result.content);
                context.push(message.clone());
                produced.push(message);
            }
        };

        if outcome == RunOutcome::Aborted {
            self.emit(AgentEvent::Content {
                text: ABORTED_NOTICE.to_string(),
            });
        }

        tracing::info!(
            turns = turn,
            total_tokens = usage.total_tokens,
            outcome = ?outcome,
            "agent run finished"
        );
        self.emit(AgentEvent::AgentEnd {
            total_turns: turn,
            total_usage: usage,
            outcome: outcome.clone(),
        });

        Ok(AgentResult {
            messages: produced,
            usage,
            outcome,
        })
    }

    async fn execute_call(&self, call: &ToolCallRequest, cancel: &CancellationToken) -> ToolResult {
        let name = call.function.name.as_str();
        if !self.tool_names.contains(name) {
            return ToolResult::error(format!("Tool not found: {}", name));
        }

        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => return ToolResult::error(format!("Invalid JSON arguments: {}", e)),
        };

        if let Some(err) = self
            .schema_cache
            .get(name)
            .and_then(|validator| validate_with_validator(&arguments, validator))
        {
            return ToolResult::error(err);
        }

        tracing::debug!(tool = name, id = %call.id, "dispatching tool call");
        self.toolbox.execute(call, arguments, cancel.clone()).await
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use termpilot_ai::{ChatEventStream, Role, ToolDefinition};

    /// A transport that replays one scripted event list per turn.
    struct MockTransport {
        turns: Mutex<Vec<Vec<StreamEvent>>>,
        /// When the script runs out, hang instead of finishing.
        hang_when_empty: bool,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl MockTransport {
        fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns),
                hang_when_empty: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn hanging(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns),
                hang_when_empty: true,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    impl Transport for MockTransport {
        fn stream(
            &self,
            messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _cancel: CancellationToken,
        ) -> ChatEventStream {
            self.seen.lock().push(messages);
            let events = {
                let mut turns = self.turns.lock();
                if turns.is_empty() {
                    None
                } else {
                    Some(turns.remove(0))
                }
            };
            let hang = self.hang_when_empty;
            Box::pin(async_stream::stream! {
                match events {
                    Some(events) => {
                        for event in events {
                            yield event;
                        }
                        if hang {
                            futures::future::pending::<()>().await;
                        }
                    }
                    None if hang => futures::future::pending::<()>().await,
                    None => {
                        yield StreamEvent::Content("done".into());
                        yield StreamEvent::Finished;
                    }
                }
            })
        }
    }

    /// Echoes arguments back and records every call.
    struct RecordingToolbox {
        calls: Mutex<Vec<(String, serde_json::Value)>>,
        cancel_on_execute: Option<CancellationToken>,
    }

    impl RecordingToolbox {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                cancel_on_execute: None,
            })
        }
    }

    #[async_trait]
    impl Toolbox for RecordingToolbox {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new(
                "read_file",
                "Read a file",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            )]
        }

        async fn execute(
            &self,
            call: &ToolCallRequest,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            self.calls
                .lock()
                .push((call.function.name.clone(), arguments.clone()));
            if let Some(token) = &self.cancel_on_execute {
                token.cancel();
            }
            ToolResult::text(format!("contents of {}", arguments["path"].as_str().unwrap_or("")))
        }
    }

    fn read_call(id: &str) -> StreamEvent {
        StreamEvent::ToolCall(ToolCallRequest::new(id, "read_file", r#"{"path":"a.txt"}"#))
    }

    fn agent(transport: Arc<MockTransport>, toolbox: Arc<RecordingToolbox>) -> Agent {
        Agent::new(AgentConfig::default(), transport, toolbox)
    }

    fn start() -> Vec<Message> {
        vec![Message::system("sys"), Message::user("hello")]
    }

    fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_text_reply_completes() {
        let transport = MockTransport::new(vec![vec![
            StreamEvent::Content("Hi".into()),
            StreamEvent::Usage(TokensSummary {
                prompt_tokens: 10,
                completion_tokens: 2,
                cached_tokens: 0,
                total_tokens: 12,
            }),
            StreamEvent::Finished,
        ]]);
        let agent = agent(transport.clone(), RecordingToolbox::new());
        let mut rx = agent.subscribe();

        let result = agent.run(start(), CancellationToken::new()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.messages, vec![Message::assistant("Hi")]);
        assert_eq!(result.usage.total_tokens, 12);

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&AgentEvent::AgentStart));
        assert!(events.contains(&AgentEvent::Content { text: "Hi".into() }));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::AgentEnd { outcome: RunOutcome::Completed, total_turns: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let transport = MockTransport::new(vec![
            vec![read_call("call_1"), StreamEvent::Finished],
            vec![StreamEvent::Content("It says hi".into()), StreamEvent::Finished],
        ]);
        let toolbox = RecordingToolbox::new();
        let agent = agent(transport.clone(), toolbox.clone());

        let result = agent.run(start(), CancellationToken::new()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[0].tool_calls()[0].id, "call_1");
        assert!(result.messages[0].content.is_none());
        assert_eq!(result.messages[1].role, Role::Tool);
        assert_eq!(result.messages[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(result.messages[1].text(), "contents of a.txt");
        assert_eq!(result.messages[2], Message::assistant("It says hi"));

        assert_eq!(toolbox.calls.lock().len(), 1);
        // The second request carries the tool exchange.
        assert_eq!(transport.seen.lock()[1].len(), 4);
    }

    #[tokio::test]
    async fn test_tool_calls_run_in_request_order() {
        let transport = MockTransport::new(vec![
            vec![
                StreamEvent::Content("Reading both".into()),
                read_call("a"),
                StreamEvent::ToolCall(ToolCallRequest::new(
                    "b",
                    "read_file",
                    r#"{"path":"b.txt"}"#,
                )),
                StreamEvent::Finished,
            ],
            vec![StreamEvent::Finished],
        ]);
        let toolbox = RecordingToolbox::new();
        let agent = agent(transport, toolbox.clone());

        let result = agent.run(start(), CancellationToken::new()).await.unwrap();

        assert_eq!(result.messages[0].text(), "Reading both");
        let ids: Vec<_> = result.messages[1..]
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        let paths: Vec<_> = toolbox.calls.lock().iter().map(|(_, a)| a["path"].clone()).collect();
        assert_eq!(paths, vec![json!("a.txt"), json!("b.txt")]);
        // Empty final reply appends nothing.
        assert_eq!(result.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_stream_error_fails_run_with_partial_delta() {
        let transport = MockTransport::new(vec![
            vec![read_call("call_1"), StreamEvent::Finished],
            vec![StreamEvent::Error("HTTP 500: boom".into())],
        ]);
        let agent = agent(transport, RecordingToolbox::new());
        let mut rx = agent.subscribe();

        let result = agent.run(start(), CancellationToken::new()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Failed("HTTP 500: boom".into()));
        assert_eq!(result.messages.len(), 2);
        assert!(drain(&mut rx).contains(&AgentEvent::Error {
            message: "HTTP 500: boom".into()
        }));
    }

    #[tokio::test]
    async fn test_turn_budget_ends_silently() {
        let turns = (0..5)
            .map(|i| vec![read_call(&format!("c{i}")), StreamEvent::Finished])
            .collect();
        let transport = MockTransport::new(turns);
        let config = AgentConfig {
            max_turns: 3,
            ..AgentConfig::default()
        };
        let agent = Agent::new(config, transport.clone(), RecordingToolbox::new());

        let result = agent.run(start(), CancellationToken::new()).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(transport.calls(), 3);
        assert_eq!(result.messages.len(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let transport = MockTransport::new(vec![]);
        let agent = agent(transport.clone(), RecordingToolbox::new());
        let mut rx = agent.subscribe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = agent.run(start(), cancel).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert!(result.messages.is_empty());
        assert_eq!(transport.calls(), 0);
        assert!(drain(&mut rx).contains(&AgentEvent::Content {
            text: ABORTED_NOTICE.to_string()
        }));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_aborts() {
        let transport = MockTransport::hanging(vec![vec![StreamEvent::Content("par".into())]]);
        let agent = Arc::new(agent(transport, RecordingToolbox::new()));
        let mut rx = agent.subscribe();
        let cancel = CancellationToken::new();

        let run = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(start(), cancel).await })
        };

        loop {
            if let AgentEvent::Content { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        cancel.cancel();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert!(result.messages.is_empty());
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_cancel_during_tool_skips_remaining_calls() {
        let transport = MockTransport::new(vec![vec![read_call("a"), read_call("b"), StreamEvent::Finished]]);
        let cancel = CancellationToken::new();
        let toolbox = Arc::new(RecordingToolbox {
            calls: Mutex::new(Vec::new()),
            cancel_on_execute: Some(cancel.clone()),
        });
        let agent = Agent::new(AgentConfig::default(), transport.clone(), toolbox.clone());

        let result = agent.run(start(), cancel).await.unwrap();

        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(toolbox.calls.lock().len(), 1);
        // Every requested call still gets an answer.
        assert_eq!(result.messages.len(), 3);
        assert!(result.messages[2].text().contains("Cancelled"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let transport = MockTransport::hanging(vec![]);
        let agent = Arc::new(agent(transport, RecordingToolbox::new()));
        let cancel = CancellationToken::new();

        let first = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(start(), cancel).await })
        };
        while !agent.is_running() {
            tokio::task::yield_now().await;
        }

        let second = agent.run(start(), CancellationToken::new()).await;
        assert!(matches!(second, Err(Error::AlreadyRunning)));

        agent.handle().abort();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.outcome, RunOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_invalid_arguments_become_error_results() {
        let transport = MockTransport::new(vec![
            vec![
                StreamEvent::ToolCall(ToolCallRequest::new("c1", "read_file", r#"{"path":7}"#)),
                StreamEvent::ToolCall(ToolCallRequest::new("c2", "read_file", "{oops")),
                StreamEvent::ToolCall(ToolCallRequest::new("c3", "delete_everything", "{}")),
                StreamEvent::Finished,
            ],
            vec![StreamEvent::Finished],
        ]);
        let toolbox = RecordingToolbox::new();
        let agent = agent(transport, toolbox.clone());
        let mut rx = agent.subscribe();

        let result = agent.run(start(), CancellationToken::new()).await.unwrap();

        assert!(toolbox.calls.lock().is_empty());
        assert!(result.messages[1].text().contains("validation failed"));
        assert!(result.messages[2].text().contains("Invalid JSON"));
        assert!(result.messages[3].text().contains("Tool not found"));
        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, AgentEvent::ToolExecutionEnd { is_error: true, .. }))
            .count();
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn test_long_context_is_trimmed_before_request() {
        let transport = MockTransport::new(vec![vec![StreamEvent::Finished]]);
        let agent = agent(transport.clone(), RecordingToolbox::new());
        let mut messages = vec![Message::system("sys")];
        messages.extend((0..59).map(|i| Message::user(format!("u{i}"))));

        agent.run(messages, CancellationToken::new()).await.unwrap();

        let sent = &transport.seen.lock()[0];
        assert_eq!(sent.len(), 41);
        assert_eq!(sent[0].role, Role::System);
    }

    #[tokio::test]
    async fn test_retry_events_are_forwarded() {
        let transport = MockTransport::new(vec![vec![
            StreamEvent::Retry { attempt: 2, max: 3 },
            StreamEvent::Content("ok".into()),
            StreamEvent::Finished,
        ]]);
        let agent = agent(transport, RecordingToolbox::new());
        let mut rx = agent.subscribe();
        agent.run(start(), CancellationToken::new()).await.unwrap();
        assert!(drain(&mut rx).contains(&AgentEvent::Retry { attempt: 2, max: 3 }));
    }

    #[test]
    fn test_validate_args_wrong_type() {
        let schema = json!({
            "type": "object",
            "properties": { "count": { "type": "integer" } },
            "required": ["count"]
        });
        let validator = jsonschema::validator_for(&schema).unwrap();
        assert!(validate_with_validator(&json!({"count": 3}), &validator).is_none());
        let err = validate_with_validator(&json!({"count": "x"}), &validator).unwrap();
        assert!(err.contains("/count"));
    }
}

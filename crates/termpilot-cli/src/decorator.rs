//! Wires one terminal session to the agent.
//!
//! The decorator sits between the user's keyboard and the shell. Keystrokes
//! go through the [`InputMultiplexer`]; shell output feeds the
//! [`ContextBuffer`]; agent events are rendered back into the terminal.

use chrono::Local;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use termpilot_agent::{
    Agent, AgentConfig, AgentEvent, AgentResult, ApprovalGate, Transport, conversation,
};
use termpilot_ai::{Message, TokensSummary};
use termpilot_term::theme::to_crlf;
use termpilot_term::{ContextBuffer, InputAction, InputMultiplexer, TerminalIo, Theme};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessRunner;
use crate::prompt::{self, PromptContext};
use crate::tools::{self, Sandbox};
use crate::usage::{UsageStore, format_summary};

/// Messages carried between runs, excluding the system prompt
pub const MAX_HISTORY: usize = 40;

/// Tool arguments longer than this are shortened in the activity line
const MAX_ARGUMENT_PREVIEW: usize = 80;

pub struct DecoratorOptions {
    pub cwd: PathBuf,
    pub shell: String,
    pub runner: ProcessRunner,
    pub context_lines: usize,
    pub theme: Theme,
    pub agent: AgentConfig,
    /// Where per-provider usage is persisted, if anywhere
    pub usage: Option<UsageStore>,
    pub provider_id: String,
}

#[derive(Default)]
struct Session {
    history: Vec<Message>,
    /// Context position at the end of the last run
    checkpoint: Option<u64>,
    totals: TokensSummary,
}

struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct TerminalDecorator {
    io: Arc<dyn TerminalIo>,
    agent: Agent,
    sandbox: Arc<Sandbox>,
    context: Mutex<ContextBuffer>,
    input: Arc<Mutex<InputMultiplexer>>,
    session: Mutex<Session>,
    active: Mutex<Option<ActiveRun>>,
    theme: Theme,
    shell: String,
    usage: Option<UsageStore>,
    provider_id: String,
}

impl TerminalDecorator {
    pub fn new(
        io: Arc<dyn TerminalIo>,
        transport: Arc<dyn Transport>,
        options: DecoratorOptions,
    ) -> Arc<Self> {
        let gate = Arc::new(ApprovalGate::new());
        let sandbox = Arc::new(Sandbox::new(
            options.cwd.clone(),
            gate.clone(),
            options.runner,
        ));
        let agent = Agent::new(options.agent, transport, sandbox.clone());
        let input = Arc::new(Mutex::new(InputMultiplexer::new(options.theme.clone())));

        {
            let input = input.clone();
            let io = io.clone();
            let theme = options.theme.clone();
            gate.set_notifier(Arc::new(move |description: &str| {
                input.lock().on_confirmation_requested();
                let prompt = theme.warning(&format!(
                    "? {} [Enter: allow, Ctrl-C: deny]",
                    description
                ));
                show(io.as_ref(), &format!("\n{} ", prompt));
            }));
        }

        let mut context = ContextBuffer::new(options.context_lines);
        context.set_cwd(options.cwd);

        Arc::new(Self {
            io,
            agent,
            sandbox,
            context: Mutex::new(context),
            input,
            session: Mutex::new(Session::default()),
            active: Mutex::new(None),
            theme: options.theme,
            shell: options.shell,
            usage: options.usage,
            provider_id: options.provider_id,
        })
    }

    /// Keyboard bytes on their way to the shell
    pub fn handle_input(self: &Arc<Self>, bytes: &[u8]) {
        let actions = self.input.lock().feed(bytes);
        for action in actions {
            match action {
                InputAction::Shell(bytes) => {
                    if let Err(e) = self.io.write_to_shell(&bytes) {
                        tracing::warn!(error = %e, "write to shell failed");
                    }
                }
                InputAction::Echo(text) => show(self.io.as_ref(), &text),
                InputAction::StartAgent(query) => self.start_run(query),
                InputAction::Abort => self.abort(),
                InputAction::Confirm(approved) => self.confirm(approved),
            }
        }
    }

    /// Output bytes from the shell, already shown to the user
    pub fn handle_output(&self, bytes: &[u8]) {
        let changed = self.context.lock().push_output(bytes);
        if let Some(cwd) = changed {
            self.sandbox.set_cwd(cwd);
        }
    }

    /// Explicit working directory report from the host
    pub fn set_cwd(&self, cwd: impl Into<PathBuf>) {
        let cwd = cwd.into();
        self.context.lock().set_cwd(cwd.clone());
        self.sandbox.set_cwd(cwd);
    }

    /// A new shell session replaced the old one
    pub fn attach(&self) {
        self.abort();
        self.context.lock().clear();
        self.input.lock().reset();
        *self.session.lock() = Session::default();
        tracing::info!("terminal session attached");
    }

    /// Cancel any run and wait for it to wind down
    pub async fn detach(&self) {
        self.abort();
        self.wait_for_run().await;
    }

    #[cfg(test)]
    fn state(&self) -> termpilot_term::TerminalState {
        self.input.lock().state().clone()
    }

    #[cfg(test)]
    fn history(&self) -> Vec<Message> {
        self.session.lock().history.clone()
    }

    #[cfg(test)]
    fn session_totals(&self) -> TokensSummary {
        self.session.lock().totals
    }

    #[cfg(test)]
    fn cwd(&self) -> PathBuf {
        self.sandbox.cwd()
    }

    /// Wait for the current run, if any, to finish
    pub async fn wait_for_run(&self) {
        let task = self.active.lock().take().map(|run| run.task);
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "agent run task failed");
            }
        }
    }

    pub(crate) fn start_run(self: &Arc<Self>, query: String) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|run| !run.task.is_finished()) {
            tracing::debug!("agent already running, ignoring query");
            return;
        }

        let (messages, user) = self.build_messages(&query);
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move { this.drive(messages, user, run_cancel).await });
        *active = Some(ActiveRun { cancel, task });
    }

    fn abort(&self) {
        if let Some(run) = self.active.lock().as_ref() {
            tracing::info!("agent run cancelled by user");
            run.cancel.cancel();
        }
    }

    fn confirm(&self, approved: bool) {
        if !self.sandbox.gate().resolve(approved) {
            tracing::debug!("no confirmation pending");
        }
        self.input.lock().on_confirmation_answered();
        let answer = if approved {
            self.theme.tool("allowed")
        } else {
            self.theme.error("denied")
        };
        show(self.io.as_ref(), &format!("{}\n", answer));
    }

    /// `[system] + history + user`, capped
    fn build_messages(&self, query: &str) -> (Vec<Message>, Message) {
        let (history, checkpoint) = {
            let session = self.session.lock();
            (session.history.clone(), session.checkpoint)
        };
        let (snapshot, activity) = {
            let context = self.context.lock();
            let activity = checkpoint
                .map(|checkpoint| context.since(checkpoint).0)
                .unwrap_or_default();
            (context.snapshot(), activity)
        };

        let cwd = self.sandbox.cwd();
        let system = Message::system(prompt::system_prompt(&PromptContext {
            cwd: &cwd,
            shell: &self.shell,
            now: Local::now(),
            terminal: &snapshot,
        }));
        let user = Message::user(prompt::user_message(query, &activity));

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(system);
        messages.extend(history);
        messages.push(user.clone());
        conversation::trim(&mut messages, MAX_HISTORY + 1, MAX_HISTORY);
        (messages, user)
    }

    async fn drive(self: Arc<Self>, messages: Vec<Message>, user: Message, cancel: CancellationToken) {
        let pump = tokio::spawn(render_events(
            self.agent.subscribe(),
            self.io.clone(),
            self.input.clone(),
            self.theme.clone(),
        ));

        match self.agent.run(messages, cancel).await {
            Ok(result) => {
                if let Err(e) = pump.await {
                    tracing::warn!(error = %e, "event renderer failed");
                }
                self.finish_run(user, result).await;
            }
            Err(e) => {
                pump.abort();
                tracing::warn!(error = %e, "agent run rejected");
                show(
                    self.io.as_ref(),
                    &format!("\n{}\n", self.theme.error(&e.to_string())),
                );
            }
        }

        self.input.lock().on_run_end();
        if let Err(e) = self.io.write_to_shell(b"\r") {
            tracing::warn!(error = %e, "write to shell failed");
        }
    }

    async fn finish_run(&self, user: Message, result: AgentResult) {
        let checkpoint = self.context.lock().checkpoint();
        let totals = {
            let mut session = self.session.lock();
            session.history.push(user);
            session.history.extend(result.messages);
            conversation::keep_last(&mut session.history, MAX_HISTORY);
            session.totals.add(&result.usage);
            session.checkpoint = Some(checkpoint);
            session.totals
        };

        if result.usage.is_empty() {
            return;
        }
        if let Some(store) = self.usage.clone() {
            let provider = self.provider_id.clone();
            let usage = result.usage;
            match tokio::task::spawn_blocking(move || store.record(&provider, &usage)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist usage"),
                Err(e) => tracing::warn!(error = %e, "usage persistence task failed"),
            }
        }
        show(
            self.io.as_ref(),
            &format!("\n{}\n", self.theme.thought(&format_summary(&result.usage, &totals))),
        );
    }
}

/// Render agent events until the run ends
async fn render_events(
    mut events: broadcast::Receiver<AgentEvent>,
    io: Arc<dyn TerminalIo>,
    input: Arc<Mutex<InputMultiplexer>>,
    theme: Theme,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event renderer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let terminal = event.is_terminal();
        match event {
            AgentEvent::AgentStart | AgentEvent::AgentEnd { .. } => {}
            AgentEvent::TurnStart { turn_number } => {
                tracing::debug!(turn_number, "turn started");
            }
            AgentEvent::Content { text } => show(io.as_ref(), &text),
            AgentEvent::Thought { text } => show(io.as_ref(), &theme.thought(&text)),
            AgentEvent::Retry { attempt, max } => {
                let notice = theme.warning(&format!("retrying ({}/{})", attempt, max));
                show(io.as_ref(), &format!("\n{}\n", notice));
            }
            AgentEvent::ToolExecutionStart {
                tool_name,
                arguments,
                ..
            } => {
                input.lock().on_tool_start();
                // Gated tools announce themselves through the confirmation prompt.
                if tools::is_read_only(&tool_name) {
                    let line = format!("> {} {}", tool_name, preview(&arguments));
                    show(io.as_ref(), &format!("\n{}\n", theme.tool(&line)));
                }
            }
            AgentEvent::ToolExecutionEnd {
                tool_name,
                result,
                is_error,
                ..
            } => {
                input.lock().on_tool_end();
                if is_error {
                    let first = result.lines().next().unwrap_or_default();
                    let line = format!("  {} failed: {}", tool_name, first);
                    show(io.as_ref(), &format!("{}\n", theme.error(&line)));
                }
            }
            AgentEvent::Error { message } => {
                show(io.as_ref(), &format!("\n{}\n", theme.error(&format!("error: {}", message))));
            }
        }
        if terminal {
            break;
        }
    }
}

fn preview(arguments: &str) -> String {
    let compact = arguments.split_whitespace().collect::<Vec<_>>().join(" ");
    match compact.char_indices().nth(MAX_ARGUMENT_PREVIEW) {
        Some((cut, _)) => format!("{}...", &compact[..cut]),
        None => compact,
    }
}

fn show(io: &dyn TerminalIo, text: &str) {
    if let Err(e) = io.write_to_display(&to_crlf(text)) {
        tracing::warn!(error = %e, "write to display failed");
    }
}

//! Agent event types

use serde::{Deserialize, Serialize};
use termpilot_ai::TokensSummary;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The model stopped requesting tools, or the turn budget ran out
    Completed,
    /// The run was cancelled
    Aborted,
    /// The endpoint reported a terminal failure
    Failed(String),
}

/// Events emitted during agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Agent started processing
    AgentStart,

    /// A new turn started
    TurnStart { turn_number: u32 },

    /// Assistant text delta
    Content { text: String },

    /// Reasoning delta
    Thought { text: String },

    /// The endpoint request is being retried
    Retry { attempt: u32, max: u32 },

    /// Tool execution started
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// Error occurred
    Error { message: String },

    /// Agent finished processing
    AgentEnd {
        total_turns: u32,
        total_usage: TokensSummary,
        outcome: RunOutcome,
    },
}

impl AgentEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::AgentEnd { .. })
    }
}

//! termpilot-agent: multi-turn tool-calling loop
//!
//! Streams completions through a [`Transport`], executes requested tools
//! through a [`Toolbox`] and reports progress as [`AgentEvent`]s.

pub mod agent;
pub mod approval;
pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod tool;
pub mod transport;

pub use agent::{ABORTED_NOTICE, Agent, AgentConfig, AgentResult};
pub use approval::{ApprovalGate, ApprovalNotifier};
pub use error::{Error, Result};
pub use events::{AgentEvent, RunOutcome};
pub use handle::AgentHandle;
pub use tool::{NoTools, ToolResult, Toolbox};
pub use transport::{ProviderTransport, Transport};

//! termpilot-term: terminal-side plumbing
//!
//! Captures recent shell output, intercepts the `@ ` trigger in keyboard
//! input and renders agent output into a raw-mode terminal.

pub mod ansi;
pub mod context;
pub mod input;
pub mod theme;

use std::io;

pub use context::ContextBuffer;
pub use input::{InputAction, InputMultiplexer, TerminalState};
pub use theme::Theme;

/// The terminal session a decorator is attached to
pub trait TerminalIo: Send + Sync {
    /// Raw bytes for the shell's input
    fn write_to_shell(&self, bytes: &[u8]) -> io::Result<()>;

    /// Text shown to the user without passing through the shell
    fn write_to_display(&self, text: &str) -> io::Result<()>;
}

//! Input handling
//!
//! Raw keyboard bytes headed for the shell pass through [`InputMultiplexer`],
//! which recognises the `@ ` trigger at the start of a line and captures the
//! query typed after it.

use crate::theme::Theme;

const CTRL_C: u8 = 0x03;
const BACKSPACE: u8 = 0x08;
const LINE_FEED: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';
const ESCAPE: u8 = 0x1b;
const DELETE: u8 = 0x7f;

/// Moves the cursor back over one cell and blanks it
pub const ERASE: &str = "\x08 \x08";

/// Interception state of one terminal session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TerminalState {
    /// Keystrokes go to the shell
    #[default]
    Normal,
    /// `@` typed at line start, waiting for the space
    Pending,
    /// Collecting the query
    Capturing { prompt: String },
    /// Agent run in progress
    AgentStreaming,
    /// Waiting for the user to confirm a tool
    AgentConfirming,
    /// A tool is running
    AgentExecuting,
}

impl TerminalState {
    /// Whether an agent run owns the terminal
    pub fn is_agent_active(&self) -> bool {
        matches!(
            self,
            TerminalState::AgentStreaming
                | TerminalState::AgentConfirming
                | TerminalState::AgentExecuting
        )
    }
}

/// What the caller should do with a chunk of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// Forward bytes to the shell
    Shell(Vec<u8>),
    /// Show text locally without involving the shell
    Echo(String),
    /// Start an agent run with this query
    StartAgent(String),
    /// Cancel the active run
    Abort,
    /// Answer the pending confirmation
    Confirm(bool),
}

/// Byte-level state machine splitting user input between the shell and the
/// agent.
#[derive(Debug, Clone)]
pub struct InputMultiplexer {
    state: TerminalState,
    at_line_start: bool,
    theme: Theme,
}

impl Default for InputMultiplexer {
    fn default() -> Self {
        Self::new(Theme::default())
    }
}

impl InputMultiplexer {
    pub fn new(theme: Theme) -> Self {
        Self {
            state: TerminalState::Normal,
            at_line_start: true,
            theme,
        }
    }

    pub fn state(&self) -> &TerminalState {
        &self.state
    }

    pub fn at_line_start(&self) -> bool {
        self.at_line_start
    }

    /// Process one chunk read from the keyboard. A single byte is a keystroke;
    /// longer chunks are pastes or escape sequences.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<InputAction> {
        match bytes {
            [] => Vec::new(),
            [byte] => self.feed_byte(*byte),
            _ => self.feed_chunk(bytes),
        }
    }

    fn feed_byte(&mut self, byte: u8) -> Vec<InputAction> {
        match std::mem::take(&mut self.state) {
            TerminalState::Normal => {
                if byte == b'@' && self.at_line_start {
                    self.state = TerminalState::Pending;
                    self.at_line_start = false;
                    return vec![InputAction::Echo(self.theme.trigger("@"))];
                }
                self.at_line_start = resets_line(byte);
                vec![InputAction::Shell(vec![byte])]
            }
            TerminalState::Pending => match byte {
                b' ' => {
                    self.state = TerminalState::Capturing {
                        prompt: String::new(),
                    };
                    vec![InputAction::Echo(" ".to_string())]
                }
                BACKSPACE | DELETE => {
                    self.at_line_start = true;
                    vec![InputAction::Echo(ERASE.to_string())]
                }
                other => self.release_trigger(&[other]),
            },
            TerminalState::Capturing { mut prompt } => match byte {
                CARRIAGE_RETURN | LINE_FEED => {
                    let query = prompt.trim().to_string();
                    if query.is_empty() {
                        self.at_line_start = true;
                        vec![InputAction::Shell(vec![CARRIAGE_RETURN])]
                    } else {
                        self.state = TerminalState::AgentStreaming;
                        vec![
                            InputAction::Echo("\r\n".to_string()),
                            InputAction::StartAgent(query),
                        ]
                    }
                }
                CTRL_C | ESCAPE => {
                    self.at_line_start = true;
                    vec![InputAction::Shell(vec![CARRIAGE_RETURN])]
                }
                BACKSPACE | DELETE => {
                    let erased = prompt.pop().is_some();
                    self.state = TerminalState::Capturing { prompt };
                    if erased {
                        vec![InputAction::Echo(ERASE.to_string())]
                    } else {
                        Vec::new()
                    }
                }
                0x20..=0x7e => {
                    let c = byte as char;
                    prompt.push(c);
                    self.state = TerminalState::Capturing { prompt };
                    vec![InputAction::Echo(c.to_string())]
                }
                _ => {
                    self.state = TerminalState::Capturing { prompt };
                    Vec::new()
                }
            },
            state @ (TerminalState::AgentStreaming | TerminalState::AgentExecuting) => {
                self.state = state;
                if byte == CTRL_C {
                    vec![InputAction::Abort]
                } else {
                    Vec::new()
                }
            }
            TerminalState::AgentConfirming => {
                self.state = TerminalState::AgentConfirming;
                match byte {
                    CARRIAGE_RETURN | LINE_FEED => vec![InputAction::Confirm(true)],
                    CTRL_C => vec![InputAction::Confirm(false)],
                    _ => Vec::new(),
                }
            }
        }
    }

    fn feed_chunk(&mut self, bytes: &[u8]) -> Vec<InputAction> {
        match std::mem::take(&mut self.state) {
            TerminalState::Normal => {
                self.at_line_start = bytes.last().copied().is_some_and(resets_line);
                vec![InputAction::Shell(bytes.to_vec())]
            }
            TerminalState::Pending => self.release_trigger(bytes),
            TerminalState::Capturing { mut prompt } => {
                let text: String = String::from_utf8_lossy(&strip_escapes(bytes))
                    .chars()
                    .filter(|c| !c.is_control())
                    .collect();
                prompt.push_str(&text);
                self.state = TerminalState::Capturing { prompt };
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![InputAction::Echo(text)]
                }
            }
            agent_state => {
                self.state = agent_state;
                Vec::new()
            }
        }
    }

    /// The `@` was not a trigger after all: take back the local echo and
    /// hand it to the shell together with what followed.
    fn release_trigger(&mut self, following: &[u8]) -> Vec<InputAction> {
        self.state = TerminalState::Normal;
        self.at_line_start = following.last().copied().is_some_and(resets_line);
        let mut bytes = Vec::with_capacity(following.len() + 1);
        bytes.push(b'@');
        bytes.extend_from_slice(following);
        vec![
            InputAction::Echo(ERASE.to_string()),
            InputAction::Shell(bytes),
        ]
    }

    /// A tool asked for confirmation
    pub fn on_confirmation_requested(&mut self) {
        if self.state.is_agent_active() {
            self.state = TerminalState::AgentConfirming;
        }
    }

    /// The pending confirmation was answered
    pub fn on_confirmation_answered(&mut self) {
        if self.state == TerminalState::AgentConfirming {
            self.state = TerminalState::AgentExecuting;
        }
    }

    pub fn on_tool_start(&mut self) {
        if self.state == TerminalState::AgentStreaming {
            self.state = TerminalState::AgentExecuting;
        }
    }

    pub fn on_tool_end(&mut self) {
        if self.state == TerminalState::AgentExecuting {
            self.state = TerminalState::AgentStreaming;
        }
    }

    /// The run finished; the caller asks the shell to redraw its prompt.
    pub fn on_run_end(&mut self) {
        if self.state.is_agent_active() {
            self.state = TerminalState::Normal;
            self.at_line_start = true;
        }
    }

    /// A new shell session was attached
    pub fn reset(&mut self) {
        self.state = TerminalState::Normal;
        self.at_line_start = true;
    }
}

/// Remove CSI (`ESC [ ... final`) and SS3 (`ESC O x`) sequences, such as
/// arrow and function keys. Any other ESC is dropped on its own.
fn strip_escapes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != ESCAPE {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += match bytes.get(i + 1) {
            Some(b'[') => {
                let params = bytes[i + 2..]
                    .iter()
                    .position(|b| (0x40..=0x7e).contains(b))
                    .unwrap_or(bytes.len() - i - 2);
                params + 3
            }
            Some(b'O') => 3,
            _ => 1,
        };
    }
    out
}

/// Bytes after which the shell starts a fresh prompt line
fn resets_line(byte: u8) -> bool {
    matches!(byte, CARRIAGE_RETURN | CTRL_C)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> InputMultiplexer {
        InputMultiplexer::new(Theme::plain())
    }

    fn feed_each(mux: &mut InputMultiplexer, bytes: &[u8]) -> Vec<InputAction> {
        bytes.iter().flat_map(|b| mux.feed(&[*b])).collect()
    }

    fn shell_bytes(actions: &[InputAction]) -> Vec<u8> {
        actions
            .iter()
            .filter_map(|a| match a {
                InputAction::Shell(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_trigger_and_query() {
        let mut mux = mux();
        let actions = feed_each(&mut mux, b"@ list\r");

        assert_eq!(
            actions,
            vec![
                InputAction::Echo("@".into()),
                InputAction::Echo(" ".into()),
                InputAction::Echo("l".into()),
                InputAction::Echo("i".into()),
                InputAction::Echo("s".into()),
                InputAction::Echo("t".into()),
                InputAction::Echo("\r\n".into()),
                InputAction::StartAgent("list".into()),
            ]
        );
        assert_eq!(mux.state(), &TerminalState::AgentStreaming);
    }

    #[test]
    fn test_at_mid_line_goes_to_shell() {
        let mut mux = mux();
        let actions = feed_each(&mut mux, b"git commit -m @x");
        assert_eq!(shell_bytes(&actions), b"git commit -m @x".to_vec());
        assert_eq!(mux.state(), &TerminalState::Normal);
    }

    #[test]
    fn test_trigger_only_after_enter() {
        let mut mux = mux();
        feed_each(&mut mux, b"ls\r");
        assert!(mux.at_line_start());
        mux.feed(b"@");
        assert_eq!(mux.state(), &TerminalState::Pending);
    }

    #[test]
    fn test_ctrl_c_resets_line_start() {
        let mut mux = mux();
        feed_each(&mut mux, b"abc");
        assert!(!mux.at_line_start());
        mux.feed(&[CTRL_C]);
        assert!(mux.at_line_start());
    }

    #[test]
    fn test_pending_other_byte_releases_at() {
        let mut mux = mux();
        mux.feed(b"@");
        let actions = mux.feed(b"h");
        assert_eq!(
            actions,
            vec![
                InputAction::Echo(ERASE.into()),
                InputAction::Shell(b"@h".to_vec())
            ]
        );
        assert_eq!(mux.state(), &TerminalState::Normal);
        assert!(!mux.at_line_start());
    }

    #[test]
    fn test_pending_backspace_cancels() {
        let mut mux = mux();
        mux.feed(b"@");
        assert_eq!(mux.feed(&[DELETE]), vec![InputAction::Echo(ERASE.into())]);
        assert_eq!(mux.state(), &TerminalState::Normal);
        assert!(mux.at_line_start());
    }

    #[test]
    fn test_pending_chunk_behaves_like_other_byte() {
        let mut mux = mux();
        mux.feed(b"@");
        let actions = mux.feed(b"\x1b[A");
        assert_eq!(shell_bytes(&actions), b"@\x1b[A".to_vec());
        assert_eq!(mux.state(), &TerminalState::Normal);
    }

    #[test]
    fn test_capturing_backspace() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ ab");
        assert_eq!(mux.feed(&[BACKSPACE]), vec![InputAction::Echo(ERASE.into())]);
        assert_eq!(
            mux.state(),
            &TerminalState::Capturing {
                prompt: "a".into()
            }
        );
        mux.feed(&[DELETE]);
        assert!(mux.feed(&[DELETE]).is_empty());
    }

    #[test]
    fn test_capturing_escape_discards() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ oops");
        assert_eq!(
            mux.feed(&[ESCAPE]),
            vec![InputAction::Shell(vec![CARRIAGE_RETURN])]
        );
        assert_eq!(mux.state(), &TerminalState::Normal);
        assert!(mux.at_line_start());
    }

    #[test]
    fn test_capturing_empty_enter_returns_to_shell() {
        let mut mux = mux();
        let actions = feed_each(&mut mux, b"@   \r");
        assert_eq!(actions.last(), Some(&InputAction::Shell(vec![CARRIAGE_RETURN])));
        assert_eq!(mux.state(), &TerminalState::Normal);
    }

    #[test]
    fn test_capturing_paste_strips_controls() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ ");
        let actions = mux.feed("why \u{e9}\r\nerror".as_bytes());
        assert_eq!(actions, vec![InputAction::Echo("why \u{e9}error".into())]);
        mux.feed(b"\r");
        assert_eq!(mux.state(), &TerminalState::AgentStreaming);
    }

    #[test]
    fn test_capturing_drops_escape_sequences() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ ls");
        assert!(mux.feed(b"\x1b[A").is_empty());
        assert!(mux.feed(b"\x1bOD").is_empty());
        assert!(mux.feed(b"\x1b[1;5C").is_empty());
        assert_eq!(
            mux.state(),
            &TerminalState::Capturing {
                prompt: "ls".to_string()
            }
        );

        let actions = mux.feed(b"\x1b[200~ -la\x1b[201~");
        assert_eq!(actions, vec![InputAction::Echo(" -la".into())]);
    }

    #[test]
    fn test_streaming_only_ctrl_c_matters() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ go\r");
        assert!(mux.feed(b"x").is_empty());
        assert!(mux.feed(b"\r").is_empty());
        assert!(mux.feed(b"paste").is_empty());
        assert_eq!(mux.feed(&[CTRL_C]), vec![InputAction::Abort]);
        assert_eq!(mux.state(), &TerminalState::AgentStreaming);
    }

    #[test]
    fn test_confirming_enter_and_ctrl_c() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ delete tmp\r");
        mux.on_confirmation_requested();
        assert_eq!(mux.state(), &TerminalState::AgentConfirming);

        assert!(mux.feed(b"y").is_empty());
        assert_eq!(mux.feed(&[CTRL_C]), vec![InputAction::Confirm(false)]);
        // The byte alone does not move the state.
        assert_eq!(mux.state(), &TerminalState::AgentConfirming);
        assert_eq!(mux.feed(b"\r"), vec![InputAction::Confirm(true)]);
    }

    #[test]
    fn test_lifecycle_hooks() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ run tests\r");

        mux.on_tool_start();
        assert_eq!(mux.state(), &TerminalState::AgentExecuting);
        mux.on_tool_end();
        assert_eq!(mux.state(), &TerminalState::AgentStreaming);

        mux.on_confirmation_requested();
        mux.on_confirmation_answered();
        assert_eq!(mux.state(), &TerminalState::AgentExecuting);

        mux.on_run_end();
        assert_eq!(mux.state(), &TerminalState::Normal);
        assert!(mux.at_line_start());
    }

    #[test]
    fn test_hooks_ignored_outside_runs() {
        let mut mux = mux();
        mux.on_confirmation_requested();
        mux.on_tool_start();
        assert_eq!(mux.state(), &TerminalState::Normal);
        feed_each(&mut mux, b"@ x");
        mux.on_run_end();
        assert!(matches!(mux.state(), TerminalState::Capturing { .. }));
    }

    #[test]
    fn test_late_tool_end_does_not_leave_confirmation() {
        let mut mux = mux();
        feed_each(&mut mux, b"@ x\r");
        mux.on_confirmation_requested();
        mux.on_tool_end();
        assert_eq!(mux.state(), &TerminalState::AgentConfirming);
    }
}

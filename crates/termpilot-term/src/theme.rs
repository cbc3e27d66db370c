//! Color theme for locally rendered output

use std::borrow::Cow;

use crossterm::style::{Color, Stylize};

/// Colors for text the agent writes into the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Theme {
    /// The echoed `@` trigger
    pub accent: Option<Color>,
    /// Reasoning text
    pub dim: Option<Color>,
    /// Tool activity lines
    pub tool: Option<Color>,
    /// Confirmation prompts
    pub warning: Option<Color>,
    /// Failures
    pub error: Option<Color>,
}

impl Default for Theme {
    fn default() -> Self {
        Self::dark()
    }
}

impl Theme {
    /// Dark theme (default)
    pub fn dark() -> Self {
        Self {
            accent: Some(Color::Cyan),
            dim: Some(Color::DarkGrey),
            tool: Some(Color::Blue),
            warning: Some(Color::Yellow),
            error: Some(Color::Red),
        }
    }

    /// No colors at all (dumb terminals, `NO_COLOR`)
    pub fn plain() -> Self {
        Self {
            accent: None,
            dim: None,
            tool: None,
            warning: None,
            error: None,
        }
    }

    pub fn trigger(&self, text: &str) -> String {
        paint(text, self.accent, true)
    }

    pub fn thought(&self, text: &str) -> String {
        paint(text, self.dim, false)
    }

    pub fn tool(&self, text: &str) -> String {
        paint(text, self.tool, false)
    }

    pub fn warning(&self, text: &str) -> String {
        paint(text, self.warning, true)
    }

    pub fn error(&self, text: &str) -> String {
        paint(text, self.error, false)
    }
}

fn paint(text: &str, color: Option<Color>, bold: bool) -> String {
    match color {
        Some(color) if bold => text.with(color).bold().to_string(),
        Some(color) => text.with(color).to_string(),
        None => text.to_string(),
    }
}

/// Raw mode needs explicit carriage returns before every line feed.
pub fn to_crlf(text: &str) -> Cow<'_, str> {
    if !text.contains('\n') {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    let mut previous = None;
    for c in text.chars() {
        if c == '\n' && previous != Some('\r') {
            out.push('\r');
        }
        out.push(c);
        previous = Some(c);
    }
    Cow::Owned(out)
}

//! Escape sequence handling for captured shell output

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

/// CSI, OSC and two-byte escape sequences
static ANSI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[@-Z\\-_]")
        .expect("ANSI pattern is valid")
});

/// OSC 7 working directory report: `ESC ] 7 ; file://host/path BEL|ST`
static OSC7_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\]7;file://[^/\x07\x1b]*(/[^\x07\x1b]*)(?:\x07|\x1b\\)")
        .expect("OSC 7 pattern is valid")
});

/// Remove escape sequences and control characters from one line of output.
///
/// Carriage-return redraws (progress bars) keep only the last segment.
pub fn strip_ansi(line: &str) -> String {
    let stripped: Cow<str> = ANSI_PATTERN.replace_all(line, "");
    let visible = stripped
        .trim_end_matches(['\r', '\n'])
        .rsplit('\r')
        .next()
        .unwrap_or_default();
    visible
        .chars()
        .filter(|c| *c == '\t' || !c.is_control())
        .collect()
}

/// The last complete OSC 7 report in `text`, percent-decoded.
pub fn last_cwd_report(text: &str) -> Option<PathBuf> {
    let raw = OSC7_PATTERN
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))?
        .as_str();
    let decoded = urlencoding::decode(raw)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    Some(PathBuf::from(decoded))
}

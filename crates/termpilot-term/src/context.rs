//! Rolling capture of recent terminal output.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::ansi::{last_cwd_report, strip_ansi};

/// Default number of lines kept
pub const DEFAULT_CAPACITY: usize = 100;

/// Unterminated output beyond this many bytes is committed as a line
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// Bounded, ordered lines of recent shell output with a monotonically
/// increasing count of every line ever committed.
///
/// The count doubles as a checkpoint: [`ContextBuffer::since`] returns what
/// arrived after a checkpoint, as far as it is still retained.
#[derive(Debug, Clone)]
pub struct ContextBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    total_seen: u64,
    pending: Vec<u8>,
    cwd: Option<PathBuf>,
}

impl Default for ContextBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ContextBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total_seen: 0,
            pending: Vec::new(),
            cwd: None,
        }
    }

    /// Record raw output bytes. Returns the new working directory when the
    /// output carried an OSC 7 report that changed it.
    pub fn push_output(&mut self, bytes: &[u8]) -> Option<PathBuf> {
        self.pending.extend_from_slice(bytes);

        let mut changed = None;
        if let Some(cwd) = last_cwd_report(&String::from_utf8_lossy(&self.pending)) {
            if self.cwd.as_deref() != Some(cwd.as_path()) {
                tracing::debug!(cwd = %cwd.display(), "working directory reported");
                self.cwd = Some(cwd.clone());
                changed = Some(cwd);
            }
        }

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            self.commit(&raw);
        }
        if self.pending.len() > MAX_PENDING_BYTES {
            let raw = std::mem::take(&mut self.pending);
            self.commit(&raw);
        }
        changed
    }

    fn commit(&mut self, raw: &[u8]) {
        let line = strip_ansi(&String::from_utf8_lossy(raw));
        if line.trim().is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total_seen += 1;
    }

    /// Retained lines, oldest first, plus the unterminated current line
    pub fn snapshot(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.lines.iter().cloned().collect();
        let current = strip_ansi(&String::from_utf8_lossy(&self.pending));
        if !current.trim().is_empty() {
            lines.push(current);
        }
        lines
    }

    /// The current position in the output
    pub fn checkpoint(&self) -> u64 {
        self.total_seen
    }

    /// Lines committed after `checkpoint` that are still retained, and the
    /// checkpoint to use next time.
    pub fn since(&self, checkpoint: u64) -> (Vec<String>, u64) {
        let oldest = self.total_seen - self.lines.len() as u64;
        let skip = checkpoint.saturating_sub(oldest).min(self.lines.len() as u64) as usize;
        let lines = self.lines.iter().skip(skip).cloned().collect();
        (lines, self.total_seen)
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = Some(cwd.into());
    }

    /// Forget captured output (new session attached). The line counter keeps
    /// counting so outstanding checkpoints stay valid.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buffer = ContextBuffer::new(10);
        buffer.push_output(b"hel");
        buffer.push_output(b"lo\r\nwor");
        buffer.push_output(b"ld\n");
        assert_eq!(buffer.snapshot(), vec!["hello", "world"]);
        assert_eq!(buffer.total_seen(), 2);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut buffer = ContextBuffer::new(10);
        let text = "caf\u{e9}\n".as_bytes();
        buffer.push_output(&text[..4]);
        buffer.push_output(&text[4..]);
        assert_eq!(buffer.snapshot(), vec!["caf\u{e9}"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = ContextBuffer::new(3);
        for i in 0..5 {
            buffer.push_output(format!("line {i}\n").as_bytes());
        }
        assert_eq!(buffer.snapshot(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.total_seen(), 5);
    }

    #[test]
    fn test_since_checkpoint() {
        let mut buffer = ContextBuffer::new(100);
        buffer.push_output(b"before\n");
        let checkpoint = buffer.checkpoint();
        buffer.push_output(b"$ cargo build\nerror[E0425]\n");

        let (lines, next) = buffer.since(checkpoint);
        assert_eq!(lines, vec!["$ cargo build", "error[E0425]"]);
        assert_eq!(next, 3);
        assert!(buffer.since(next).0.is_empty());
    }

    #[test]
    fn test_since_evicted_checkpoint_returns_retained() {
        let mut buffer = ContextBuffer::new(2);
        let checkpoint = buffer.checkpoint();
        buffer.push_output(b"a\nb\nc\n");
        assert_eq!(buffer.since(checkpoint).0, vec!["b", "c"]);
    }

    #[test]
    fn test_partial_line_in_snapshot_not_committed() {
        let mut buffer = ContextBuffer::new(10);
        buffer.push_output(b"done\n\x1b[32muser@host\x1b[0m $ ");
        assert_eq!(buffer.snapshot(), vec!["done", "user@host $ "]);
        assert_eq!(buffer.total_seen(), 1);
    }

    #[test]
    fn test_cwd_report_updates_cwd_once() {
        let mut buffer = ContextBuffer::new(10);
        let first = buffer.push_output(b"\x1b]7;file://host/tmp/project\x07$ ");
        assert_eq!(first, Some(PathBuf::from("/tmp/project")));
        assert_eq!(buffer.push_output(b"l"), None);
        assert_eq!(buffer.cwd(), Some(Path::new("/tmp/project")));
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buffer = ContextBuffer::new(10);
        buffer.push_output(b"\n\r\n  \nx\n");
        assert_eq!(buffer.snapshot(), vec!["x"]);
    }

    #[test]
    fn test_clear_keeps_counter() {
        let mut buffer = ContextBuffer::new(10);
        buffer.push_output(b"a\nb\n");
        buffer.clear();
        assert!(buffer.snapshot().is_empty());
        assert_eq!(buffer.checkpoint(), 2);
        buffer.push_output(b"c\n");
        assert_eq!(buffer.since(2).0, vec!["c"]);
    }
}

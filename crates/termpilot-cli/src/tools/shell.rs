//! Shell command execution tool

use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio_util::sync::CancellationToken;

use crate::process::{ProcessRunner, ShellResult};

pub const NAME: &str = "run_shell_command";

/// Output beyond this many characters loses its middle
const MAX_OUTPUT_CHARS: usize = 30_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Args {
    pub command: String,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Run a shell command in the terminal's current working directory. \
         Returns stdout, stderr and the exit code. Requires user confirmation.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute"
                }
            },
            "required": ["command"]
        }),
    )
}

pub async fn execute(
    runner: &ProcessRunner,
    args: &Args,
    cwd: &Path,
    cancel: &CancellationToken,
) -> ToolResult {
    match runner.run(&args.command, cwd, cancel).await {
        Ok(result) if cancel.is_cancelled() && result.exit_code.is_none() => {
            ToolResult::error(format!("{}\n\nCommand cancelled", fold(&result)))
        }
        Ok(result) if result.success() => ToolResult::text(fold(&result)),
        Ok(result) => ToolResult::error(fold(&result)),
        Err(e) => ToolResult::error(format!(
            "Failed to spawn command with {}: {}",
            runner.shell(),
            e
        )),
    }
}

/// Render a result as the text the model reads
fn fold(result: &ShellResult) -> String {
    let mut output = String::new();
    if !result.stdout.trim().is_empty() {
        output.push_str(result.stdout.trim_end());
    }
    if !result.stderr.trim().is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str("[stderr]\n");
        output.push_str(result.stderr.trim_end());
    }
    if output.is_empty() {
        output.push_str("(no output)");
    }

    let mut output = elide_middle(&output, MAX_OUTPUT_CHARS);
    if result.timed_out {
        output.push_str("\n\nCommand timed out and was terminated");
    } else if let Some(code) = result.exit_code {
        if code != 0 {
            output.push_str(&format!("\n\nCommand exited with code {}", code));
        }
    } else if let Some(signal) = result.signal {
        output.push_str(&format!("\n\nCommand was terminated by signal {}", signal));
    }
    output
}

/// Keep the head and the tail of `text`, dropping the middle
pub fn elide_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let keep = max_chars / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    format!(
        "{}\n\n... ({} characters omitted) ...\n\n{}",
        head,
        total - keep * 2,
        tail
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Some("/bin/sh".to_string()))
    }

    fn args(command: &str) -> Args {
        Args {
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn test_success() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(&runner(), &args("echo hi"), dir.path(), &CancellationToken::new()).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(
            &runner(),
            &args("echo oops >&2; exit 2"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_error);
        assert!(result.content.contains("[stderr]\noops"));
        assert!(result.content.ends_with("Command exited with code 2"));
    }

    #[tokio::test]
    async fn test_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(&runner(), &args("true"), dir.path(), &CancellationToken::new()).await;
        assert_eq!(result.content, "(no output)");
    }

    #[tokio::test]
    async fn test_timeout_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner().with_timeout(std::time::Duration::from_millis(100));
        let result = execute(&runner, &args("sleep 5"), dir.path(), &CancellationToken::new()).await;
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_outside_signal_explained() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(&runner(), &args("kill -9 $$"), dir.path(), &CancellationToken::new()).await;
        assert!(result.is_error);
        assert_eq!(result.content, "(no output)\n\nCommand was terminated by signal 9");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_tool_result() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Some("/nonexistent/sh".to_string()));
        let result = execute(&runner, &args("ls"), dir.path(), &CancellationToken::new()).await;
        assert!(result.is_error);
        assert!(result.content.starts_with("Failed to spawn command"));
    }

    #[test]
    fn test_elide_middle() {
        let text: String = (0..100).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let elided = elide_middle(&text, 20);
        assert!(elided.starts_with(&text[..10]));
        assert!(elided.ends_with(&text[90..]));
        assert!(elided.contains("80 characters omitted"));
        assert_eq!(elide_middle("short", 20), "short");
    }
}

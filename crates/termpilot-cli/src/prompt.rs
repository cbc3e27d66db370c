//! Prompt construction from terminal state

use chrono::{DateTime, Local};
use std::path::Path;

/// Everything the system prompt describes
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub cwd: &'a Path,
    pub shell: &'a str,
    pub now: DateTime<Local>,
    /// Recent terminal output, oldest first
    pub terminal: &'a [String],
}

/// System prompt for one run, rebuilt from the current terminal snapshot
pub fn system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are termpilot, an assistant embedded in the user's terminal session. \
You see what the user sees in the terminal and help with their shell work: \
explaining output and errors, suggesting commands, and making changes when asked.

Environment:
- Operating system: {os} ({arch})
- Shell: {shell}
- Working directory: {cwd}
- Date: {date}

Tools:
- list_directory, glob_search and grep_search run without asking.
- run_shell_command, read_file, write_file and replace_in_file ask the user \
for confirmation first. If the user declines, do not retry the same action; \
ask what they would prefer instead.
- Every path must stay inside the working directory. Credential files and \
directories are off limits.

Your replies are printed directly into the terminal, so keep them short, \
use plain text rather than heavy markdown, and put commands on their own lines.",
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        shell = ctx.shell,
        cwd = ctx.cwd.display(),
        date = ctx.now.format("%Y-%m-%d"),
    );

    if !ctx.terminal.is_empty() {
        prompt.push_str("\n\nRecent terminal output (oldest first):\n```\n");
        prompt.push_str(&ctx.terminal.join("\n"));
        prompt.push_str("\n```");
    }
    prompt
}

/// The user's query, preceded by any terminal activity since their last one
pub fn user_message(query: &str, activity: &[String]) -> String {
    if activity.is_empty() {
        return query.to_string();
    }
    format!(
        "Terminal activity since last turn:\n```\n{}\n```\n\n{}",
        activity.join("\n"),
        query
    )
}

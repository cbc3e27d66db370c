//! Find-and-replace editing tool

use serde::Deserialize;
use serde_json::json;
use similar::TextDiff;
use std::path::Path;
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio::fs;

pub const NAME: &str = "replace_in_file";

const MAX_DIFF_LINES: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct Args {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default = "one")]
    pub expected_replacements: usize,
}

fn one() -> usize {
    1
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Replace text in a file inside the working directory. old_string should match \
         the file exactly, including whitespace; if it does not, lines are compared \
         ignoring surrounding whitespace. The number of matches must equal \
         expected_replacements (default 1). Requires user confirmation.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "old_string": {
                    "type": "string",
                    "description": "Text to find"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "expected_replacements": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "How many occurrences to replace (default 1)"
                }
            },
            "required": ["path", "old_string", "new_string"]
        }),
    )
}

/// How `old_string` was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    Exact,
    /// Line by line, ignoring leading and trailing whitespace
    Flexible,
}

pub async fn execute(args: &Args, path: &Path) -> ToolResult {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("Failed to read {}: {}", args.path, e)),
    };

    let (updated, mode) = match apply(
        &content,
        &args.old_string,
        &args.new_string,
        args.expected_replacements,
    ) {
        Ok(result) => result,
        Err(message) => return ToolResult::error(format!("{}: {}", args.path, message)),
    };

    if updated == content {
        return ToolResult::error(format!(
            "No changes made to {}. The replacement produced identical content.",
            args.path
        ));
    }

    let diff = unified_diff(&content, &updated, &args.path);
    if let Err(e) = fs::write(path, &updated).await {
        return ToolResult::error(format!("Failed to write {}: {}", args.path, e));
    }

    let note = match mode {
        MatchMode::Exact => "",
        MatchMode::Flexible => " (matched ignoring indentation)",
    };
    ToolResult::text(format!(
        "Replaced {} occurrence(s) in {}{}.\n\n{}",
        args.expected_replacements, args.path, note, diff
    ))
}

/// Compute the new content, or explain why nothing may be written
fn apply(
    content: &str,
    old: &str,
    new: &str,
    expected: usize,
) -> Result<(String, MatchMode), String> {
    if old.is_empty() {
        return Err("old_string must not be empty".to_string());
    }

    let count = content.matches(old).count();
    if count > 0 {
        check_count(count, expected)?;
        return Ok((content.replace(old, new), MatchMode::Exact));
    }

    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let needle = trimmed_needle(old);
    if needle.is_empty() {
        return Err(not_found());
    }

    let mut starts = Vec::new();
    let mut i = 0;
    while i + needle.len() <= lines.len() {
        if needle
            .iter()
            .enumerate()
            .all(|(j, want)| lines[i + j].trim() == *want)
        {
            starts.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    if starts.is_empty() {
        return Err(not_found());
    }
    check_count(starts.len(), expected)?;

    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = String::with_capacity(content.len() + new.len());
    let mut cursor = 0;
    for start in starts {
        for line in &lines[cursor..start] {
            out.push_str(line);
        }
        let indent = leading_whitespace(lines[start]);
        let last = lines[start + needle.len() - 1];
        if !new.is_empty() {
            out.push_str(&reindent(new, indent, newline));
            out.push_str(line_ending(last));
        }
        cursor = start + needle.len();
    }
    for line in &lines[cursor..] {
        out.push_str(line);
    }
    Ok((out, MatchMode::Flexible))
}

fn check_count(found: usize, expected: usize) -> Result<(), String> {
    if found == expected {
        Ok(())
    } else {
        Err(format!(
            "expected {} replacement(s) but found {} occurrence(s) of old_string. \
             No changes were made. Add surrounding context or set expected_replacements.",
            expected, found
        ))
    }
}

fn not_found() -> String {
    "could not find old_string. The file may have changed; re-read it with read_file \
     and copy the exact text to replace."
        .to_string()
}

/// `old` as trimmed lines, without blank lines at either end
fn trimmed_needle(old: &str) -> Vec<&str> {
    let mut needle: Vec<&str> = old.lines().map(str::trim).collect();
    while needle.last().is_some_and(|l| l.is_empty()) {
        needle.pop();
    }
    let leading = needle.iter().take_while(|l| l.is_empty()).count();
    needle.drain(..leading);
    needle
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}

fn line_ending(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

/// Shift `text` so its first non-blank line starts at `indent`, keeping the
/// indentation of the other lines relative to it.
fn reindent(text: &str, indent: &str, newline: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let base = lines
        .iter()
        .find(|l| !l.trim().is_empty())
        .map(|l| leading_whitespace(l))
        .unwrap_or("");
    lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else if let Some(rest) = line.strip_prefix(base) {
                format!("{indent}{rest}")
            } else {
                format!("{indent}{}", line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join(newline)
}

/// Generate a unified diff string
fn unified_diff(old: &str, new: &str, path: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string();

    let mut lines: Vec<&str> = text.lines().collect();
    if lines.len() > MAX_DIFF_LINES {
        lines.truncate(MAX_DIFF_LINES);
        lines.push("... (diff truncated)");
    }
    lines.join("\n")
}

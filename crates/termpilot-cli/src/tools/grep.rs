//! Grep content search tool

use glob::{MatchOptions, Pattern};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio_util::sync::CancellationToken;

use super::{display_path, guard, list_files};

pub const NAME: &str = "grep_search";

const MAX_MATCHES: usize = 200;
/// Maximum length of a matching line before truncation
const MAX_LINE_LENGTH: usize = 500;
/// Files with a NUL byte in this prefix are treated as binary
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Debug, Clone, Deserialize)]
pub struct Args {
    pub pattern: String,
    pub path: Option<String>,
    /// Glob restricting which files are searched
    pub include: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Search file contents with a regular expression. Returns matching lines \
         with file paths and line numbers. Inside a git repository, ignored files \
         are skipped.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (defaults to the working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to filter files (e.g. '*.rs')"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Whether to ignore case (default: false)"
                }
            },
            "required": ["pattern"]
        }),
    )
}

/// One matching line, path relative to the search root
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hit {
    path: String,
    line: usize,
    text: String,
}

pub async fn execute(
    args: &Args,
    root: &Path,
    cwd: &Path,
    cancel: &CancellationToken,
) -> ToolResult {
    let regex = match RegexBuilder::new(&args.pattern)
        .case_insensitive(args.case_insensitive)
        .build()
    {
        Ok(regex) => regex,
        Err(e) => return ToolResult::error(format!("Invalid regex pattern: {}", e)),
    };
    let include = match args.include.as_deref().map(Pattern::new).transpose() {
        Ok(include) => include,
        Err(e) => return ToolResult::error(format!("Invalid include pattern: {}", e)),
    };

    let Some(files) = list_files(root, cancel).await else {
        return ToolResult::error("Search cancelled");
    };
    let Some(hits) = search(&files, root, &regex, include.as_ref(), cancel) else {
        return ToolResult::error("Search cancelled");
    };

    let lines: Vec<String> = hits
        .into_iter()
        .filter_map(|hit| {
            let full = root.join(&hit.path);
            if guard::is_blocked(full.strip_prefix(cwd).unwrap_or(&full)) {
                return None;
            }
            Some(format!(
                "{}:{}: {}",
                display_path(&full, cwd),
                hit.line,
                truncate_line(&hit.text)
            ))
        })
        .collect();

    if lines.is_empty() {
        return ToolResult::text("No matches found");
    }

    let total = lines.len();
    let mut output = lines
        .into_iter()
        .take(MAX_MATCHES)
        .collect::<Vec<_>>()
        .join("\n");
    if total > MAX_MATCHES {
        output.push_str(&format!("\n\n(showing first {} matches)", MAX_MATCHES));
    }
    ToolResult::text(output)
}

/// Scan `files` (relative to `root`) in order. `None` when cancelled.
fn search(
    files: &[PathBuf],
    root: &Path,
    regex: &Regex,
    include: Option<&Pattern>,
    cancel: &CancellationToken,
) -> Option<Vec<Hit>> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    let mut hits = Vec::new();
    for rel in files {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(include) = include {
            let by_path = include.matches_path_with(rel, options);
            let by_name = rel
                .file_name()
                .is_some_and(|name| include.matches_with(&name.to_string_lossy(), options));
            if !by_path && !by_name {
                continue;
            }
        }
        search_file(root, rel, regex, &mut hits);
        if hits.len() > MAX_MATCHES {
            break;
        }
    }
    Some(hits)
}

fn search_file(root: &Path, rel: &Path, regex: &Regex, hits: &mut Vec<Hit>) {
    let Ok(bytes) = std::fs::read(root.join(rel)) else {
        return;
    };
    if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
        return;
    }
    let content = String::from_utf8_lossy(&bytes);
    for (index, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            hits.push(Hit {
                path: rel.to_string_lossy().into_owned(),
                line: index + 1,
                text: line.to_string(),
            });
        }
    }
}

/// Truncate a line if it exceeds MAX_LINE_LENGTH
fn truncate_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_LENGTH) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

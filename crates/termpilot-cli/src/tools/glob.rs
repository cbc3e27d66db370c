//! Glob file pattern matching tool

use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio_util::sync::CancellationToken;

use super::{display_path, guard, list_files};

pub const NAME: &str = "glob_search";

const MAX_RESULTS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Args {
    pub pattern: String,
    pub path: Option<String>,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Find files matching a glob pattern such as '**/*.rs' or 'src/*.ts'. \
         Inside a git repository, ignored files are skipped.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The glob pattern to match"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (defaults to the working directory)"
                }
            },
            "required": ["pattern"]
        }),
    )
}

pub async fn execute(
    args: &Args,
    root: &Path,
    cwd: &Path,
    cancel: &CancellationToken,
) -> ToolResult {
    let pattern = match Pattern::new(&args.pattern) {
        Ok(p) => p,
        Err(e) => return ToolResult::error(format!("Invalid glob pattern: {}", e)),
    };
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    let candidates = match list_files(root, cancel).await {
        Some(files) => files,
        None => return ToolResult::error("Search cancelled"),
    };

    let mut results: Vec<String> = candidates
        .iter()
        .filter(|rel| pattern.matches_path_with(rel, options))
        .map(|rel| root.join(rel))
        .filter(|full| !guard::is_blocked(full.strip_prefix(cwd).unwrap_or(full)))
        .map(|full| display_path(&full, cwd))
        .collect();
    results.sort();
    results.dedup();

    if results.is_empty() {
        return ToolResult::text(format!("No files found matching {}", args.pattern));
    }

    let total = results.len();
    results.truncate(MAX_RESULTS);
    let mut output = results.join("\n");
    if total > MAX_RESULTS {
        output.push_str(&format!(
            "\n\n(showing first {} of {} matches)",
            MAX_RESULTS, total
        ));
    }
    ToolResult::text(output)
}

//! File reading tool

use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio::fs;

pub const NAME: &str = "read_file";

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct Args {
    pub path: String,
    /// 1-based first line
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Read a text file inside the working directory. Lines are numbered. \
         For large files, use offset and limit. Requires user confirmation.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read (default 2000)"
                }
            },
            "required": ["path"]
        }),
    )
}

pub async fn execute(args: &Args, path: &Path) -> ToolResult {
    let content = match fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => return ToolResult::error(format!("Failed to read {}: {}", args.path, e)),
    };
    render(&content, args.offset, args.limit)
}

fn render(content: &str, offset: Option<usize>, limit: Option<usize>) -> ToolResult {
    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    if total_lines == 0 {
        return ToolResult::text("(empty file)");
    }

    let start = offset.unwrap_or(1).max(1) - 1;
    let limit = limit.unwrap_or(MAX_LINES).clamp(1, MAX_LINES);
    if start >= total_lines {
        return ToolResult::error(format!(
            "Offset {} is beyond end of file ({} lines total)",
            start + 1,
            total_lines
        ));
    }
    let end = (start + limit).min(total_lines);

    let mut had_clipped = false;
    let mut output = lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let line = match line.char_indices().nth(MAX_LINE_LENGTH) {
                Some((cut, _)) => {
                    had_clipped = true;
                    &line[..cut]
                }
                None => line,
            };
            format!("{:>6}\t{}", start + i + 1, line)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut notices = Vec::new();
    if had_clipped {
        notices.push(format!(
            "Some lines were clipped to {} characters",
            MAX_LINE_LENGTH
        ));
    }
    if end < total_lines {
        notices.push(format!(
            "{} more lines not shown. Use offset={} to continue reading",
            total_lines - end,
            end + 1
        ));
    }
    if !notices.is_empty() {
        output.push_str(&format!("\n\n... ({})", notices.join(". ")));
    }

    ToolResult::text(output)
}

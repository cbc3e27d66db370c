//! List directory tool

use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio::fs;

use super::{display_path, guard};

pub const NAME: &str = "list_directory";

const MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Args {
    pub path: Option<String>,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "List the entries of a directory inside the working directory, including \
         hidden ones. Directories end with '/', files show their size.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (defaults to the working directory)"
                }
            },
            "required": []
        }),
    )
}

pub async fn execute(dir: &Path, cwd: &Path) -> ToolResult {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(d) => d,
        Err(e) => {
            return ToolResult::error(format!(
                "Failed to list {}: {}",
                display_path(dir, cwd),
                e
            ));
        }
    };

    let mut entries = Vec::new();
    loop {
        let entry = match read_dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "directory read stopped early");
                break;
            }
        };
        let path = entry.path();
        let relative = path.strip_prefix(cwd).unwrap_or(&path);
        if guard::is_blocked(relative) {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let line = match entry.metadata().await {
            Ok(meta) if meta.is_dir() => format!("{}/", name),
            Ok(meta) => format!("{}\t{}", name, format_size(meta.len())),
            Err(_) => name.clone(),
        };
        entries.push((name, line));
    }

    if entries.is_empty() {
        return ToolResult::text("(empty directory)");
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let total = entries.len();
    let mut output = entries
        .into_iter()
        .take(MAX_ENTRIES)
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n");
    if total > MAX_ENTRIES {
        output.push_str(&format!(
            "\n\n(showing first {} of {} entries)",
            MAX_ENTRIES, total
        ));
    }
    ToolResult::text(output)
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

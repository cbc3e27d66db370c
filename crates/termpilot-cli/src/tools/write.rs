//! File writing tool

use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use termpilot_agent::ToolResult;
use termpilot_ai::ToolDefinition;
use tokio::fs;

pub const NAME: &str = "write_file";

#[derive(Debug, Clone, Deserialize)]
pub struct Args {
    pub path: String,
    pub content: String,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        NAME,
        "Write content to a file inside the working directory. Creates the file \
         and parent directories if needed, overwrites existing content. \
         Requires user confirmation.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write"
                }
            },
            "required": ["path", "content"]
        }),
    )
}

pub async fn execute(args: &Args, path: &Path) -> ToolResult {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            return ToolResult::error(format!("Failed to create directories: {}", e));
        }
    }

    let existed = fs::try_exists(path).await.unwrap_or(false);
    match fs::write(path, &args.content).await {
        Ok(()) => ToolResult::text(format!(
            "{} {} ({} bytes, {} lines)",
            if existed { "Overwrote" } else { "Created" },
            args.path,
            args.content.len(),
            args.content.lines().count()
        )),
        Err(e) => ToolResult::error(format!("Failed to write {}: {}", args.path, e)),
    }
}

//! Tool execution seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use termpilot_ai::{ToolCallRequest, ToolDefinition};
use tokio_util::sync::CancellationToken;

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text returned to the model
    pub content: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }

    pub fn text_content(&self) -> &str {
        &self.content
    }
}

/// The set of tools offered to the model.
///
/// Execution never fails past this boundary: every problem becomes an error
/// `ToolResult` the model can read.
#[async_trait]
pub trait Toolbox: Send + Sync {
    /// Definitions sent with every request
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Execute one call. `arguments` has already been parsed and validated
    /// against the tool's schema.
    async fn execute(
        &self,
        call: &ToolCallRequest,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// A toolbox with no tools
pub struct NoTools;

#[async_trait]
impl Toolbox for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(
        &self,
        call: &ToolCallRequest,
        _arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        ToolResult::error(format!("Tool not found: {}", call.function.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_text() {
        let r = ToolResult::text("ok");
        assert!(!r.is_error);
        assert_eq!(r.text_content(), "ok");
    }

    #[test]
    fn test_tool_result_error() {
        let r = ToolResult::error("bad");
        assert!(r.is_error);
        assert_eq!(r.text_content(), "bad");
    }

    #[tokio::test]
    async fn test_no_tools_rejects_everything() {
        let call = ToolCallRequest::new("c1", "read_file", "{}");
        let result = NoTools
            .execute(&call, serde_json::json!({}), CancellationToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("read_file"));
        assert!(NoTools.definitions().is_empty());
    }
}

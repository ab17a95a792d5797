//! `write_file`: create or overwrite a file inside the workspace.

use crate::sandboxed;
use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use codeward_security::PathPolicy;
use std::sync::Arc;

const PREVIEW_CHARS: usize = 400;

pub struct FileWriteTool {
    policy: Arc<PathPolicy>,
}

impl FileWriteTool {
    pub fn new(policy: Arc<PathPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file (and parent directories) if needed, overwrites if it exists."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn preview(&self, arguments: &serde_json::Value) -> String {
        let path = arguments["path"].as_str().unwrap_or("?");
        let content = arguments["content"].as_str().unwrap_or_default();
        let mut shown: String = content.chars().take(PREVIEW_CHARS).collect();
        if content.chars().count() > PREVIEW_CHARS {
            shown.push_str("\n...");
        }
        format!("Write {} bytes to {path}:\n{shown}", content.len())
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"].as_str().unwrap_or_default();
        let content = arguments["content"].as_str().unwrap_or_default();
        let resolved = sandboxed(&self.policy, self.name(), path)?;

        if let Some(parent) = resolved.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolOutput::error(format!("Failed to create directory: {e}")));
        }

        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "Successfully wrote {} bytes to {path}",
                content.len()
            ))),
            Err(e) => Ok(ToolOutput::error(format!("Failed to write {path}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_effecting_and_previewed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileWriteTool::new(Arc::new(PathPolicy::new(dir.path())));
        assert!(!tool.read_only());
        assert!(tool.requires_approval());
        let preview = tool.preview(&serde_json::json!({"path": "a.rs", "content": "fn main() {}"}));
        assert!(preview.contains("a.rs"));
        assert!(preview.contains("fn main"));
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileWriteTool::new(Arc::new(PathPolicy::new(dir.path())));
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let result = tool
            .execute(serde_json::json!({"path": "src/lib.rs", "content": "pub fn x() {}"}))
            .await
            .unwrap();
        assert!(result.success);
        let written = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert_eq!(written, "pub fn x() {}");
    }
}

//! `delete_file`: remove a single file inside the workspace.

use crate::sandboxed;
use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use codeward_security::PathPolicy;
use std::sync::Arc;

pub struct FileDeleteTool {
    policy: Arc<PathPolicy>,
}

impl FileDeleteTool {
    pub fn new(policy: Arc<PathPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for FileDeleteTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file. Directories are not removed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The file to delete" }
            },
            "required": ["path"]
        })
    }

    fn preview(&self, arguments: &serde_json::Value) -> String {
        format!("Delete {}", arguments["path"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"].as_str().unwrap_or_default();
        let resolved = sandboxed(&self.policy, self.name(), path)?;

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_dir() => {
                return Ok(ToolOutput::error(format!("{path} is a directory")));
            }
            Ok(_) => {}
            Err(e) => return Ok(ToolOutput::error(format!("Cannot delete {path}: {e}"))),
        }

        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => Ok(ToolOutput::ok(format!("Deleted {path}"))),
            Err(e) => Ok(ToolOutput::error(format!("Failed to delete {path}: {e}"))),
        }
    }
}

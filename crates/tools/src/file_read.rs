//! `read_file`: read file contents inside the workspace.

use crate::sandboxed;
use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use codeward_security::PathPolicy;
use std::sync::Arc;

pub struct FileReadTool {
    policy: Arc<PathPolicy>,
}

impl FileReadTool {
    pub fn new(policy: Arc<PathPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Optionally read a window of lines with start_line (1-based) and line_count."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read, relative to the workspace"
                },
                "start_line": { "type": "integer", "minimum": 1 },
                "line_count": { "type": "integer", "minimum": 1 }
            },
            "required": ["path"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"].as_str().unwrap_or_default();
        let resolved = sandboxed(&self.policy, self.name(), path)?;

        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => content,
            Err(e) => return Ok(ToolOutput::error(format!("Failed to read {path}: {e}"))),
        };

        let start = arguments["start_line"].as_u64().map(|n| n as usize);
        let count = arguments["line_count"].as_u64().map(|n| n as usize);
        if start.is_none() && count.is_none() {
            return Ok(ToolOutput::ok(content));
        }

        let skip = start.unwrap_or(1).saturating_sub(1);
        let window: Vec<&str> = content
            .lines()
            .skip(skip)
            .take(count.unwrap_or(usize::MAX))
            .collect();
        Ok(ToolOutput::ok(window.join("\n")).with_data(serde_json::json!({
            "total_lines": content.lines().count(),
            "start_line": skip + 1,
        })))
    }
}

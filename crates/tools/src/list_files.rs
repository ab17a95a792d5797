//! `list_files`: list directory entries inside the workspace.

use crate::{SKIPPED_DIRS, sandboxed};
use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use codeward_security::PathPolicy;
use std::path::PathBuf;
use std::sync::Arc;

const MAX_ENTRIES: usize = 1000;
const DEFAULT_DEPTH: u64 = 3;

pub struct ListFilesTool {
    policy: Arc<PathPolicy>,
}

impl ListFilesTool {
    pub fn new(policy: Arc<PathPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories. Directories end with '/'. Set recursive to walk subdirectories."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list, relative to the workspace" },
                "recursive": { "type": "boolean" },
                "max_depth": { "type": "integer", "minimum": 1, "maximum": 10 }
            },
            "required": ["path"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"].as_str().unwrap_or(".");
        let recursive = arguments["recursive"].as_bool().unwrap_or(false);
        let max_depth = if recursive {
            arguments["max_depth"].as_u64().unwrap_or(DEFAULT_DEPTH) as usize
        } else {
            1
        };
        let root = sandboxed(&self.policy, self.name(), path)?;
        if !root.is_dir() {
            return Ok(ToolOutput::error(format!("{path} is not a directory")));
        }

        let mut entries = Vec::new();
        let mut truncated = false;
        let mut stack: Vec<(PathBuf, usize)> = vec![(root.clone(), 1)];
        'walk: while let Some((dir, depth)) = stack.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = reader.next_entry().await {
                if entries.len() >= MAX_ENTRIES {
                    truncated = true;
                    break 'walk;
                }
                let entry_path = entry.path();
                let relative = entry_path
                    .strip_prefix(&root)
                    .unwrap_or(&entry_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    entries.push(format!("{relative}/"));
                    let name = entry.file_name();
                    let skipped = SKIPPED_DIRS.iter().any(|s| name == *s);
                    if depth < max_depth && !skipped {
                        stack.push((entry_path, depth + 1));
                    }
                } else {
                    entries.push(relative);
                }
            }
        }

        entries.sort();
        let count = entries.len();
        let mut output = if entries.is_empty() {
            format!("{path} is empty")
        } else {
            entries.join("\n")
        };
        if truncated {
            output.push_str(&format!("\n[listing truncated at {MAX_ENTRIES} entries]"));
        }
        Ok(ToolOutput::ok(output).with_data(serde_json::json!({ "count": count, "truncated": truncated })))
    }
}

//! `search`: substring search across workspace files.

use crate::{SKIPPED_DIRS, sandboxed};
use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use codeward_security::PathPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_MAX_RESULTS: u64 = 50;
/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const MAX_LINE_CHARS: usize = 200;

pub struct SearchTool {
    policy: Arc<PathPolicy>,
}

impl SearchTool {
    pub fn new(policy: Arc<PathPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search file contents for a literal string. Returns matches as path:line: text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "minLength": 1 },
                "path": { "type": "string", "description": "Directory or file to search, defaults to the workspace" },
                "case_sensitive": { "type": "boolean" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": 500 }
            },
            "required": ["query"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let query = arguments["query"].as_str().unwrap_or_default();
        let path = arguments["path"].as_str().unwrap_or(".");
        let case_sensitive = arguments["case_sensitive"].as_bool().unwrap_or(false);
        let max_results = arguments["max_results"].as_u64().unwrap_or(DEFAULT_MAX_RESULTS) as usize;
        let root = sandboxed(&self.policy, self.name(), path)?;
        let base = self.policy.workspace().to_path_buf();

        let needle = if case_sensitive {
            query.to_string()
        } else {
            query.to_lowercase()
        };

        let mut hits = Vec::new();
        let mut files_scanned = 0usize;
        let mut stack: Vec<PathBuf> = vec![root];
        'walk: while let Some(current) = stack.pop() {
            if current.is_dir() {
                let Ok(mut reader) = tokio::fs::read_dir(&current).await else {
                    continue;
                };
                let mut children = Vec::new();
                while let Ok(Some(entry)) = reader.next_entry().await {
                    let name = entry.file_name();
                    if SKIPPED_DIRS.iter().any(|s| name == *s) {
                        continue;
                    }
                    // Never follow links.
                    let Ok(file_type) = entry.file_type().await else {
                        continue;
                    };
                    if file_type.is_symlink() {
                        continue;
                    }
                    children.push(entry.path());
                }
                // Reverse-sorted so the stack pops in name order.
                children.sort_by(|a, b| b.cmp(a));
                stack.extend(children);
                continue;
            }

            let Ok(meta) = tokio::fs::metadata(&current).await else {
                continue;
            };
            if meta.len() > MAX_FILE_BYTES {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(&current).await else {
                continue;
            };
            files_scanned += 1;
            for (idx, line) in content.lines().enumerate() {
                let haystack = if case_sensitive {
                    line.to_string()
                } else {
                    line.to_lowercase()
                };
                if haystack.contains(&needle) {
                    hits.push(format!("{}:{}: {}", display_path(&current, &base), idx + 1, clip(line.trim())));
                    if hits.len() >= max_results {
                        break 'walk;
                    }
                }
            }
        }

        let output = if hits.is_empty() {
            format!("No matches for '{query}'")
        } else {
            hits.join("\n")
        };
        Ok(ToolOutput::ok(output).with_data(serde_json::json!({
            "matches": hits.len(),
            "files_scanned": files_scanned,
        })))
    }
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn clip(line: &str) -> String {
    if line.chars().count() <= MAX_LINE_CHARS {
        line.to_string()
    } else {
        let mut s: String = line.chars().take(MAX_LINE_CHARS).collect();
        s.push('…');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "fn Alpha() {}\nfn beta() {}\n").unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "// alpha again\n").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/out.rs"), "alpha").unwrap();
        dir
    }

    #[tokio::test]
    async fn case_insensitive_by_default() {
        let dir = workspace();
        let tool = SearchTool::new(Arc::new(PathPolicy::new(dir.path())));
        let out = tool.execute(serde_json::json!({"query": "alpha"})).await.unwrap();
        let lines: Vec<&str> = out.output.lines().collect();
        assert_eq!(lines, vec!["src/a.rs:1: fn Alpha() {}", "src/b.rs:1: // alpha again"]);
    }

    #[tokio::test]
    async fn case_sensitive_and_limited() {
        let dir = workspace();
        let tool = SearchTool::new(Arc::new(PathPolicy::new(dir.path())));
        let out = tool
            .execute(serde_json::json!({"query": "alpha", "case_sensitive": true, "max_results": 1}))
            .await
            .unwrap();
        assert_eq!(out.output, "src/b.rs:1: // alpha again");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let dir = workspace();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.rs"), "alpha outside").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.rs"), dir.path().join("linked.rs")).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("src/loop")).unwrap();

        let tool = SearchTool::new(Arc::new(PathPolicy::new(dir.path())));
        let out = tool.execute(serde_json::json!({"query": "alpha"})).await.unwrap();
        let lines: Vec<&str> = out.output.lines().collect();
        assert_eq!(lines, vec!["src/a.rs:1: fn Alpha() {}", "src/b.rs:1: // alpha again"]);
    }

    #[tokio::test]
    async fn no_matches_reported() {
        let dir = workspace();
        let tool = SearchTool::new(Arc::new(PathPolicy::new(dir.path())));
        let out = tool.execute(serde_json::json!({"query": "gamma"})).await.unwrap();
        assert!(out.success);
        assert!(out.output.contains("No matches"));
    }
}

//! `run_command`: execute a shell command in the workspace.
//!
//! Supports command allowlisting. With an allowlist configured, a command
//! must be a single allowlisted program: shell control characters are
//! refused. The child is killed if the dispatch timeout drops the future.

use async_trait::async_trait;
use codeward_core::{Tool, ToolError, ToolOutput};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// Characters that let one command line start another program.
const CONTROL_CHARS: &[char] = &[';', '&', '|', '$', '`', '<', '>', '(', ')', '\n', '\r'];

pub struct ShellTool {
    /// If non-empty, only these programs may be started.
    allowed_commands: Vec<String>,
    workdir: PathBuf,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            allowed_commands,
            workdir: workdir.into(),
        }
    }

    /// `Err` carries the reason a command may not run.
    fn check_command(&self, command: &str) -> Result<(), String> {
        if self.allowed_commands.is_empty() {
            return Ok(());
        }
        if let Some(c) = command.chars().find(|c| CONTROL_CHARS.contains(c)) {
            return Err(format!("Command contains {c:?}; only single allowlisted programs may run"));
        }
        let base_cmd = command.split_whitespace().next().unwrap_or("");
        if self.allowed_commands.iter().any(|a| a == base_cmd) {
            Ok(())
        } else {
            Err(format!("Command '{base_cmd}' not in allowlist"))
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its stdout/stderr. Use for builds, tests, and git."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn preview(&self, arguments: &serde_json::Value) -> String {
        format!("$ {}", arguments["command"].as_str().unwrap_or_default())
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let command = arguments["command"].as_str().unwrap_or_default();

        if let Err(reason) = self.check_command(command) {
            warn!(command = %command, %reason, "Refused shell command");
            return Err(ToolError::PermissionDenied {
                tool_name: self.name().into(),
                reason,
            });
        }

        debug!(command = %command, "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        let output = cmd
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::failed(self.name(), e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            let text = if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            };
            Ok(ToolOutput::ok(text.trim()).with_data(serde_json::json!({ "exit_code": code })))
        } else {
            warn!(command = %command, exit_code = code, "Command failed");
            let text = format!("[exit code: {code}]\n{stdout}\n{stderr}");
            Ok(ToolOutput::error(text.trim()).with_data(serde_json::json!({ "exit_code": code })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_check() {
        let tool = ShellTool::new(vec!["ls".into(), "cargo".into(), "git".into()], ".");
        assert!(tool.check_command("ls -la").is_ok());
        assert!(tool.check_command("git status").is_ok());
        assert!(tool.check_command("rm -rf /").unwrap_err().contains("not in allowlist"));
    }

    #[test]
    fn allowlist_refuses_chained_commands() {
        let tool = ShellTool::new(vec!["ls".into(), "cargo".into()], ".");
        for command in [
            "ls && touch owned",
            "ls; rm -rf src",
            "ls | sh",
            "ls $(rm -rf src)",
            "ls `id`",
            "ls > Cargo.toml",
            "cargo test\nrm -rf src",
            "ls & curl example.com",
        ] {
            assert!(tool.check_command(command).is_err(), "{command:?} should be refused");
        }
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let tool = ShellTool::new(vec![], ".");
        assert!(tool.check_command("anything goes && more").is_ok());
        assert!(tool.requires_approval());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chained_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(vec!["ls".into()], dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "ls && touch created"}))
            .await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
        assert!(!dir.path().join("created").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let tool = ShellTool::new(vec![], dir.path());
        let result = tool.execute(serde_json::json!({"command": "ls"})).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let tool = ShellTool::new(vec![], ".");
        let result = tool.execute(serde_json::json!({"command": "exit 3"})).await.unwrap();
        assert!(!result.success);
        assert!(result.output.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn blocked_command() {
        let tool = ShellTool::new(vec!["ls".into()], ".");
        let result = tool.execute(serde_json::json!({"command": "rm -rf /"})).await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}

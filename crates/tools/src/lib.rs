//! Tool layer for Codeward.
//!
//! - [`registry`]: the name → tool table, shared with the extension manager
//! - [`dispatcher`]: mode check, argument validation, timed execution
//! - built-in tools: `read_file`, `list_files`, `search` (read-only) and
//!   `write_file`, `delete_file`, `run_command` (approval required)

pub mod dispatcher;
pub mod file_delete;
pub mod file_read;
pub mod file_write;
pub mod list_files;
pub mod registry;
pub mod schema;
pub mod search;
pub mod shell;

pub use dispatcher::{Dispatcher, PreparedCall};
pub use registry::{RegisteredTool, RegistryError, ToolRegistry, ToolSource};
pub use schema::ArgumentValidator;

use codeward_config::ToolSettings;
use codeward_core::{Tool, ToolError};
use codeward_security::PathPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directories the file walkers never descend into.
pub(crate) const SKIPPED_DIRS: [&str; 4] = [".git", "target", "node_modules", ".venv"];

/// Resolve a tool's path argument through the policy.
pub(crate) fn sandboxed(policy: &PathPolicy, tool: &str, path: &str) -> Result<PathBuf, ToolError> {
    policy.resolve(path).map_err(|e| {
        tracing::warn!(tool, path, "Path refused: {e}");
        ToolError::PermissionDenied {
            tool_name: tool.to_string(),
            reason: e.to_string(),
        }
    })
}

/// The built-in tools, sandboxed to `workspace`.
pub fn builtin_tools(workspace: &Path, settings: &ToolSettings) -> Vec<Arc<dyn Tool>> {
    let policy = Arc::new(PathPolicy::from_settings(workspace, settings));
    vec![
        Arc::new(file_read::FileReadTool::new(policy.clone())),
        Arc::new(list_files::ListFilesTool::new(policy.clone())),
        Arc::new(search::SearchTool::new(policy.clone())),
        Arc::new(file_write::FileWriteTool::new(policy.clone())),
        Arc::new(file_delete::FileDeleteTool::new(policy)),
        Arc::new(shell::ShellTool::new(
            settings.allowed_commands.clone(),
            workspace.to_path_buf(),
        )),
    ]
}

/// A registry holding every built-in tool.
pub fn default_registry(workspace: &Path, settings: &ToolSettings) -> Result<ToolRegistry, RegistryError> {
    let registry = ToolRegistry::new();
    registry.register_many(ToolSource::Builtin, builtin_tools(workspace, settings))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeward_core::OperatingMode;

    #[test]
    fn default_registry_has_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = default_registry(dir.path(), &ToolSettings::default()).unwrap();
        assert_eq!(
            registry.names(),
            vec!["delete_file", "list_files", "read_file", "run_command", "search", "write_file"]
        );
        let plan: Vec<String> = registry
            .definitions(OperatingMode::Plan)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(plan, vec!["list_files", "read_file", "search"]);
    }
}

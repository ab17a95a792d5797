//! Path validation: filesystem sandboxing for file tools.
//!
//! Relative paths resolve against the workspace directory. Resolved paths
//! must sit under an allowed root and outside every forbidden prefix.

use codeward_config::ToolSettings;
use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' is inside forbidden location '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to resolve path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// Where file tools may read and write.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    workspace: PathBuf,
    allowed_roots: Vec<PathBuf>,
    forbidden: Vec<PathBuf>,
}

impl PathPolicy {
    /// A policy rooted at `workspace`. With no explicit roots the workspace
    /// itself is the only allowed root.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let workspace = workspace.canonicalize().unwrap_or(workspace);
        Self {
            allowed_roots: vec![workspace.clone()],
            workspace,
            forbidden: Vec::new(),
        }
    }

    pub fn from_settings(workspace: impl Into<PathBuf>, settings: &ToolSettings) -> Self {
        let mut policy = Self::new(workspace);
        if !settings.allowed_roots.is_empty() {
            policy.allowed_roots = settings
                .allowed_roots
                .iter()
                .map(|root| expand_tilde(root))
                .map(|root| root.canonicalize().unwrap_or(root))
                .collect();
        }
        policy.forbidden = settings.forbidden_paths.iter().map(|p| expand_tilde(p)).collect();
        policy
    }

    pub fn with_forbidden(mut self, path: impl Into<PathBuf>) -> Self {
        self.forbidden.push(expand_tilde(&path.into()));
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Validate `path` and return it resolved.
    ///
    /// Checks, in order: no `..` components, canonical form (the parent is
    /// canonicalized for files that don't exist yet), forbidden prefixes,
    /// allowed roots.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathValidationError> {
        let input = Path::new(path);
        if input.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathValidationError::PathTraversal { path: path.into() });
        }

        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.workspace.join(input)
        };

        let canonical = if joined.exists() {
            joined
                .canonicalize()
                .map_err(|e| PathValidationError::CanonicalizeFailed {
                    path: path.into(),
                    reason: e.to_string(),
                })?
        } else if let Some(parent) = joined.parent()
            && parent.exists()
        {
            let parent = parent
                .canonicalize()
                .map_err(|e| PathValidationError::CanonicalizeFailed {
                    path: path.into(),
                    reason: format!("parent dir: {e}"),
                })?;
            parent.join(joined.file_name().unwrap_or_default())
        } else {
            joined
        };

        if let Some(hit) = self.forbidden.iter().find(|f| canonical.starts_with(f)) {
            return Err(PathValidationError::ForbiddenPath {
                path: path.into(),
                pattern: hit.display().to_string(),
            });
        }

        if !self.allowed_roots.iter().any(|root| canonical.starts_with(root)) {
            return Err(PathValidationError::OutsideAllowedRoots { path: path.into() });
        }

        Ok(canonical)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

//! The tool registry.
//!
//! Name → {tool, compiled schema, source}. Lookups hand out `Arc` clones, so
//! a dispatch that already resolved its tool is unaffected by a concurrent
//! deregistration. Batch registration for an extension server is
//! all-or-nothing under a single write lock.

use crate::schema::ArgumentValidator;
use codeward_core::{OperatingMode, Tool, ToolDefinition};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Who contributed a tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolSource {
    Builtin,
    Extension(String),
}

impl fmt::Display for ToolSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolSource::Builtin => f.write_str("builtin"),
            ToolSource::Extension(server) => write!(f, "extension:{server}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool '{name}' has an invalid parameter schema: {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("Tool '{name}' is already registered by {owner}")]
    NameConflict { name: String, owner: ToolSource },
}

/// A resolved registry entry.
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub source: ToolSource,
    validator: Arc<ArgumentValidator>,
}

impl RegisteredTool {
    pub fn validator(&self) -> &ArgumentValidator {
        &self.validator
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.tool.name())
            .field("source", &self.source)
            .field("read_only", &self.tool.read_only())
            .finish()
    }
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredTool>> {
        self.tools.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredTool>> {
        self.tools.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prepare(tool: Arc<dyn Tool>, source: ToolSource) -> Result<RegisteredTool, RegistryError> {
        let validator = ArgumentValidator::compile(&tool.parameters_schema()).map_err(|reason| {
            RegistryError::InvalidSchema {
                name: tool.name().to_string(),
                reason,
            }
        })?;
        Ok(RegisteredTool {
            tool,
            source,
            validator: Arc::new(validator),
        })
    }

    /// Register a built-in tool. Replaces an existing built-in of the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        self.register_many(ToolSource::Builtin, vec![tool]).map(|_| ())
    }

    /// Register a batch of tools from one source. Either every tool is
    /// registered or none is. Returns the registered names.
    pub fn register_many(
        &self,
        source: ToolSource,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<Vec<String>, RegistryError> {
        let prepared = tools
            .into_iter()
            .map(|t| Self::prepare(t, source.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut map = self.write();
        for entry in &prepared {
            if let Some(existing) = map.get(entry.name())
                && existing.source != source
            {
                return Err(RegistryError::NameConflict {
                    name: entry.name().to_string(),
                    owner: existing.source.clone(),
                });
            }
        }
        let names: Vec<String> = prepared.iter().map(|e| e.name().to_string()).collect();
        for entry in prepared {
            map.insert(entry.name().to_string(), entry);
        }
        tracing::debug!(source = %source, count = names.len(), "Registered tools");
        Ok(names)
    }

    /// Remove a tool. Returns whether it was registered.
    pub fn deregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Remove every tool contributed by `source`, atomically.
    pub fn deregister_source(&self, source: &ToolSource) -> Vec<String> {
        let mut map = self.write();
        let names: Vec<String> = map
            .iter()
            .filter(|(_, entry)| &entry.source == source)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            map.remove(name);
        }
        names
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Tool definitions offered to the model under `mode`, sorted by name.
    pub fn definitions(&self, mode: OperatingMode) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .read()
            .values()
            .filter(|e| mode.permits(e.tool.read_only()))
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

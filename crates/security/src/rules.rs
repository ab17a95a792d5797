//! Approval rules: the auto-approve table.
//!
//! A rule names a tool and a match kind. Calls matching an installed rule
//! skip the approval prompt. Rules with `Always` scope are persisted to a
//! JSON file (written to a temp file, then renamed); `Session` rules live
//! only as long as the table.

use chrono::{DateTime, Utc};
use codeward_config::RuleConfig;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// How a rule matches a call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleMatch {
    /// Every call to the tool
    ToolName,
    /// The argument equals `value`
    Exact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argument: Option<String>,
        value: String,
    },
    /// The argument matches the glob `pattern`
    Glob {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argument: Option<String>,
        pattern: String,
    },
}

impl RuleMatch {
    fn argument(&self) -> Option<&str> {
        match self {
            RuleMatch::ToolName => None,
            RuleMatch::Exact { argument, .. } | RuleMatch::Glob { argument, .. } => argument.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Valid while the runtime lives.
    Session,
    /// Persisted across restarts.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: String,
    pub tool: String,
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub scope: RuleScope,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn new(tool: impl Into<String>, matcher: RuleMatch, scope: RuleScope) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool: tool.into(),
            matcher,
            scope,
            created_at: Utc::now(),
        }
    }

    pub fn glob(tool: impl Into<String>, pattern: impl Into<String>, scope: RuleScope) -> Self {
        Self::new(
            tool,
            RuleMatch::Glob {
                argument: None,
                pattern: pattern.into(),
            },
            scope,
        )
    }

    pub fn from_config(config: &RuleConfig) -> Result<Self, RuleError> {
        let pattern = || {
            config
                .pattern
                .clone()
                .ok_or_else(|| RuleError::InvalidPattern {
                    pattern: String::new(),
                    reason: format!("rule for '{}' needs a pattern", config.tool),
                })
        };
        let matcher = match config.kind.as_str() {
            "tool" => RuleMatch::ToolName,
            "exact" => RuleMatch::Exact {
                argument: config.argument.clone(),
                value: pattern()?,
            },
            "glob" => RuleMatch::Glob {
                argument: config.argument.clone(),
                pattern: pattern()?,
            },
            other => return Err(RuleError::UnknownKind(other.to_string())),
        };
        Ok(Self::new(config.tool.clone(), matcher, RuleScope::Session))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown rule kind '{0}'")]
    UnknownKind(String),

    #[error("Failed to persist rules to {path}: {reason}")]
    Storage { path: PathBuf, reason: String },
}

struct CompiledRule {
    rule: ApprovalRule,
    glob: Option<GlobMatcher>,
}

impl CompiledRule {
    fn compile(rule: ApprovalRule) -> Result<Self, RuleError> {
        let glob = match &rule.matcher {
            RuleMatch::Glob { pattern, .. } => Some(
                Glob::new(pattern)
                    .map_err(|e| RuleError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?
                    .compile_matcher(),
            ),
            _ => None,
        };
        Ok(Self { rule, glob })
    }

    fn matches(&self, tool: &str, arguments: &serde_json::Value, primary: Option<&str>) -> bool {
        if self.rule.tool != tool {
            return false;
        }
        if matches!(self.rule.matcher, RuleMatch::ToolName) {
            return true;
        }
        let Some(key) = self.rule.matcher.argument().or(primary) else {
            return false;
        };
        let Some(value) = argument_text(arguments, key) else {
            return false;
        };
        match (&self.rule.matcher, &self.glob) {
            (RuleMatch::Exact { value: expected, .. }, _) => value == *expected,
            (RuleMatch::Glob { .. }, Some(glob)) => glob.is_match(&value),
            _ => false,
        }
    }
}

fn argument_text(arguments: &serde_json::Value, key: &str) -> Option<String> {
    match arguments.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// On-disk format for persisted rules.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRules {
    version: u32,
    rules: Vec<ApprovalRule>,
}

/// The installed approval rules.
pub struct RuleTable {
    rules: RwLock<Vec<CompiledRule>>,
    persist_path: Option<PathBuf>,
}

impl RuleTable {
    /// An in-memory table; `Always` rules are kept but not written anywhere.
    pub fn in_memory() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            persist_path: None,
        }
    }

    /// A table backed by `path`. Existing rules are loaded; a missing or
    /// unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut compiled = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PersistedRules>(&content) {
                Ok(persisted) => {
                    for rule in persisted.rules {
                        match CompiledRule::compile(rule) {
                            Ok(c) => compiled.push(c),
                            Err(e) => tracing::warn!(error = %e, "Skipping invalid persisted rule"),
                        }
                    }
                    tracing::debug!(count = compiled.len(), path = %path.display(), "Loaded approval rules");
                }
                Err(e) => tracing::warn!(error = %e, path = %path.display(), "Ignoring corrupt rules file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "Failed to read rules file"),
        }
        Self {
            rules: RwLock::new(compiled),
            persist_path: Some(path),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<CompiledRule>> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<CompiledRule>> {
        self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a rule, persisting the table if the rule is `Always`.
    pub fn install(&self, rule: ApprovalRule) -> Result<(), RuleError> {
        let scope = rule.scope;
        let compiled = CompiledRule::compile(rule)?;
        tracing::info!(tool = %compiled.rule.tool, rule_id = %compiled.rule.id, scope = ?scope, "Installed approval rule");
        let snapshot = {
            let mut rules = self.write();
            rules.push(compiled);
            persisted_rules(&rules)
        };
        if scope == RuleScope::Always {
            self.save(snapshot)?;
        }
        Ok(())
    }

    /// Remove a rule by id. Returns whether one was removed.
    pub fn remove(&self, id: &str) -> Result<bool, RuleError> {
        let (removed, was_persistent, snapshot) = {
            let mut rules = self.write();
            let Some(pos) = rules.iter().position(|c| c.rule.id == id) else {
                return Ok(false);
            };
            let removed = rules.remove(pos);
            (true, removed.rule.scope == RuleScope::Always, persisted_rules(&rules))
        };
        if was_persistent {
            self.save(snapshot)?;
        }
        Ok(removed)
    }

    /// The first rule matching this call, if any.
    pub fn find_match(
        &self,
        tool: &str,
        arguments: &serde_json::Value,
        primary_argument: Option<&str>,
    ) -> Option<ApprovalRule> {
        self.read()
            .iter()
            .find(|c| c.matches(tool, arguments, primary_argument))
            .map(|c| c.rule.clone())
    }

    pub fn rules(&self) -> Vec<ApprovalRule> {
        self.read().iter().map(|c| c.rule.clone()).collect()
    }

    /// Drop every `Session` rule.
    pub fn clear_session(&self) {
        self.write().retain(|c| c.rule.scope == RuleScope::Always);
    }

    fn save(&self, rules: Vec<ApprovalRule>) -> Result<(), RuleError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        write_atomic(path, &PersistedRules { version: 1, rules }).map_err(|reason| RuleError::Storage {
            path: path.clone(),
            reason,
        })?;
        tracing::debug!(path = %path.display(), "Saved approval rules");
        Ok(())
    }
}

fn persisted_rules(rules: &[CompiledRule]) -> Vec<ApprovalRule> {
    rules
        .iter()
        .filter(|c| c.rule.scope == RuleScope::Always)
        .map(|c| c.rule.clone())
        .collect()
}

fn write_atomic(path: &Path, value: &PersistedRules) -> Result<(), String> {
    let content = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(|e| e.to_string())?;
    std::fs::rename(&tmp_path, path).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glob_rule_matches_primary_argument() {
        let table = RuleTable::in_memory();
        table
            .install(ApprovalRule::glob("delete_file", "*.tmp", RuleScope::Session))
            .unwrap();

        assert!(table.find_match("delete_file", &json!({"path": "x.tmp"}), Some("path")).is_some());
        assert!(table.find_match("delete_file", &json!({"path": "x.py"}), Some("path")).is_none());
        assert!(table.find_match("write_file", &json!({"path": "x.tmp"}), Some("path")).is_none());
    }

    #[test]
    fn exact_rule_with_named_argument() {
        let table = RuleTable::in_memory();
        table
            .install(ApprovalRule::new(
                "run_command",
                RuleMatch::Exact {
                    argument: Some("command".into()),
                    value: "cargo fmt".into(),
                },
                RuleScope::Session,
            ))
            .unwrap();
        assert!(table.find_match("run_command", &json!({"command": "cargo fmt"}), None).is_some());
        assert!(table.find_match("run_command", &json!({"command": "rm -rf /"}), None).is_none());
    }

    #[test]
    fn tool_name_rule_matches_everything() {
        let table = RuleTable::in_memory();
        table
            .install(ApprovalRule::new("write_file", RuleMatch::ToolName, RuleScope::Session))
            .unwrap();
        assert!(table.find_match("write_file", &json!({}), None).is_some());
    }

    #[test]
    fn invalid_glob_rejected() {
        let table = RuleTable::in_memory();
        let err = table
            .install(ApprovalRule::glob("delete_file", "[unclosed", RuleScope::Session))
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { .. }));
    }

    #[test]
    fn always_rules_persist_and_session_rules_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approval_rules.json");
        {
            let table = RuleTable::load(&path);
            table
                .install(ApprovalRule::glob("delete_file", "*.tmp", RuleScope::Always))
                .unwrap();
            table
                .install(ApprovalRule::new("write_file", RuleMatch::ToolName, RuleScope::Session))
                .unwrap();
        }
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = RuleTable::load(&path);
        let rules = reloaded.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].tool, "delete_file");
    }

    #[test]
    fn remove_and_clear_session() {
        let table = RuleTable::in_memory();
        let rule = ApprovalRule::new("a", RuleMatch::ToolName, RuleScope::Session);
        let id = rule.id.clone();
        table.install(rule).unwrap();
        table
            .install(ApprovalRule::new("b", RuleMatch::ToolName, RuleScope::Always))
            .unwrap();
        assert!(table.remove(&id).unwrap());
        assert!(!table.remove(&id).unwrap());
        table
            .install(ApprovalRule::new("c", RuleMatch::ToolName, RuleScope::Session))
            .unwrap();
        table.clear_session();
        let names: Vec<String> = table.rules().into_iter().map(|r| r.tool).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn from_config_builds_glob() {
        let rule = ApprovalRule::from_config(&RuleConfig {
            tool: "delete_file".into(),
            kind: "glob".into(),
            argument: None,
            pattern: Some("*.log".into()),
        })
        .unwrap();
        assert!(matches!(rule.matcher, RuleMatch::Glob { .. }));
    }
}

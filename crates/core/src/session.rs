//! Session domain types.
//!
//! A session owns its messages, the ledger of tool calls issued in it, the
//! strategies it has learned, and running token counters. Only explicit
//! deletion destroys one.

use crate::message::{Message, Role};
use crate::strategy::StrategyBook;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a tool call ended up. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Pending,
    Succeeded,
    Failed { message: String, recoverable: bool },
    Denied { feedback: String },
}

impl ToolOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolOutcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ToolOutcome::Pending => "pending",
            ToolOutcome::Succeeded => "succeeded",
            ToolOutcome::Failed { .. } => "failed",
            ToolOutcome::Denied { .. } => "denied",
        }
    }
}

/// A tool call as tracked by its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub outcome: ToolOutcome,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Per-session record of every tool call and its outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLedger {
    calls: Vec<ToolCall>,
}

impl ToolCallLedger {
    /// Record a new pending call. Returns false if the id is already taken.
    pub fn issue(&mut self, id: &str, name: &str, arguments: serde_json::Value) -> bool {
        if self.contains(id) {
            return false;
        }
        self.calls.push(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
            outcome: ToolOutcome::Pending,
            issued_at: Utc::now(),
            resolved_at: None,
        });
        true
    }

    /// Move a pending call to a terminal outcome. A call resolves once;
    /// later attempts are refused and return false.
    pub fn resolve(&mut self, id: &str, outcome: ToolOutcome) -> bool {
        if !outcome.is_terminal() {
            return false;
        }
        match self.calls.iter_mut().find(|c| c.id == id) {
            Some(call) if !call.outcome.is_terminal() => {
                call.outcome = outcome;
                call.resolved_at = Some(Utc::now());
                true
            }
            Some(call) => {
                tracing::warn!(call_id = id, outcome = call.outcome.label(), "Tool call already resolved");
                false
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.calls.iter().any(|c| c.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.iter().filter(|c| !c.outcome.is_terminal())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.iter()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Running token accounting for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounters {
    /// Estimated size of the stored history
    pub estimated_context: usize,
    /// Prompt tokens reported by the provider, summed
    pub prompt_tokens: u64,
    /// Completion tokens reported by the provider, summed
    pub completion_tokens: u64,
    pub compactions: u32,
}

/// A conversation plus everything the runtime learned while having it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub messages: Vec<Message>,

    /// Index of the first message not folded into a compaction summary.
    #[serde(default)]
    pub context_cursor: usize,

    #[serde(default)]
    pub strategies: StrategyBook,

    #[serde(default)]
    pub tokens: TokenCounters,

    #[serde(default)]
    pub tool_calls: ToolCallLedger,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    pub fn with_id(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            messages: Vec::new(),
            context_cursor: 0,
            strategies: StrategyBook::new(),
            tokens: TokenCounters::default(),
            tool_calls: ToolCallLedger::default(),
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        }
    }

    /// Index of the most recent user message.
    pub fn latest_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    pub fn latest_user_message(&self) -> Option<&Message> {
        self.latest_user_index().map(|i| &self.messages[i])
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

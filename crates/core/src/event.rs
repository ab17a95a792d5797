//! Upward event stream.
//!
//! The orchestrator publishes an event at every externally interesting step
//! of a run. Front ends subscribe to render progress and surface approval
//! prompts; nothing in the core waits on a subscriber.

use crate::error::ErrorEnvelope;
use crate::session::ToolOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    IterationStarted {
        session_id: String,
        iteration: usize,
    },

    /// The reasoning-only call produced a plan.
    Thinking { session_id: String, plan: String },

    AssistantTextChunk {
        session_id: String,
        iteration: usize,
        text: String,
    },

    ToolCallProposed {
        session_id: String,
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    ApprovalRequired {
        session_id: String,
        call_id: String,
        tool_name: String,
        description: String,
        preview: String,
    },

    ToolResult {
        session_id: String,
        call_id: String,
        tool_name: String,
        outcome: ToolOutcome,
        output: String,
    },

    IterationComplete {
        session_id: String,
        iteration: usize,
        tool_calls: usize,
    },

    Compacted {
        session_id: String,
        messages_folded: usize,
        tokens_before: usize,
        tokens_after: usize,
    },

    RunFinished {
        session_id: String,
        iterations: usize,
        incomplete: bool,
    },

    Error {
        session_id: String,
        error: ErrorEnvelope,
    },
}

impl AgentEvent {
    /// Short name matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::IterationStarted { .. } => "iteration_started",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::AssistantTextChunk { .. } => "assistant_text_chunk",
            AgentEvent::ToolCallProposed { .. } => "tool_call_proposed",
            AgentEvent::ApprovalRequired { .. } => "approval_required",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::IterationComplete { .. } => "iteration_complete",
            AgentEvent::Compacted { .. } => "compacted",
            AgentEvent::RunFinished { .. } => "run_finished",
            AgentEvent::Error { .. } => "error",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::IterationStarted { session_id, .. }
            | AgentEvent::Thinking { session_id, .. }
            | AgentEvent::AssistantTextChunk { session_id, .. }
            | AgentEvent::ToolCallProposed { session_id, .. }
            | AgentEvent::ApprovalRequired { session_id, .. }
            | AgentEvent::ToolResult { session_id, .. }
            | AgentEvent::IterationComplete { session_id, .. }
            | AgentEvent::Compacted { session_id, .. }
            | AgentEvent::RunFinished { session_id, .. }
            | AgentEvent::Error { session_id, .. } => session_id,
        }
    }
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow subscribers
/// lag and miss events rather than blocking the publisher.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

//! Request payload assembly under a token budget.
//!
//! Layout, highest priority first:
//!
//! 1. **System** (system prompt, learned strategies, current plan), never trimmed
//! 2. **Tool schemas**, never trimmed, counted against the budget
//! 3. **History**, walked newest-first until the budget runs out
//!
//! The latest user message is always included, even over budget. The rest
//! of the window is the newest run of messages that fits; when that run
//! starts after the latest user message, the messages in between are left
//! out and the user message is placed directly before the run. The window
//! never opens on a `tool_result` whose call was cut off.
//!
//! # Determinism
//!
//! `build_payload` reads the session and nothing else: identical sessions
//! produce identical payloads, and the session is never modified.

use crate::strategy::render_strategies;
use crate::token;
use codeward_core::{Message, Role, Session, ToolDefinition};

// ── Types ─────────────────────────────────────────────────────────────────

/// Everything besides the session that goes into a payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadExtras<'a> {
    pub system_prompt: Option<&'a str>,
    /// Plan produced by the thinking pass.
    pub plan: Option<&'a str>,
    pub tools: &'a [ToolDefinition],
    /// Maximum strategies rendered.
    pub strategy_cap: usize,
}

/// An assembled payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub estimated_tokens: usize,
    pub budget: usize,
    /// History messages left out of the window.
    pub dropped: usize,
}

impl Payload {
    pub fn over_budget(&self) -> bool {
        self.estimated_tokens > self.budget
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────

fn system_section(session: &Session, extras: &PayloadExtras<'_>) -> Option<Message> {
    let mut sections: Vec<String> = Vec::new();
    if let Some(prompt) = extras.system_prompt.filter(|p| !p.trim().is_empty()) {
        sections.push(prompt.trim().to_string());
    }
    if let Some(strategies) = render_strategies(&session.strategies, extras.strategy_cap) {
        sections.push(strategies);
    }
    if let Some(plan) = extras.plan.filter(|p| !p.trim().is_empty()) {
        sections.push(format!("## Current plan\n{}", plan.trim()));
    }
    if sections.is_empty() {
        None
    } else {
        Some(Message::system(sections.join("\n\n")))
    }
}

/// Build the request payload for `session` under `budget` tokens.
pub fn build_payload(session: &Session, extras: &PayloadExtras<'_>, budget: usize) -> Payload {
    let system = system_section(session, extras);
    let fixed = system.as_ref().map(token::estimate_message_tokens).unwrap_or(0)
        + token::estimate_tools_tokens(extras.tools);

    let history = &session.messages;
    let pinned = session.latest_user_index();
    let mut used = fixed + pinned.map(|idx| token::estimate_message_tokens(&history[idx])).unwrap_or(0);

    let mut start = history.len();
    for (idx, message) in history.iter().enumerate().rev() {
        if Some(idx) == pinned {
            start = idx;
            continue;
        }
        let cost = token::estimate_message_tokens(message);
        if used + cost > budget {
            break;
        }
        used += cost;
        start = idx;
    }

    // Don't open the window (or the run after the pinned message) on tool
    // results whose call was dropped.
    while start < history.len() && Some(start) != pinned && history[start].role == Role::ToolResult {
        used -= token::estimate_message_tokens(&history[start]);
        start += 1;
    }

    let mut messages = Vec::with_capacity(history.len() - start + 2);
    messages.extend(system);
    let dropped = match pinned {
        Some(idx) if idx < start => {
            messages.push(history[idx].clone());
            start - 1
        }
        _ => start,
    };
    messages.extend(history[start..].iter().cloned());

    if used > budget {
        tracing::warn!(
            session_id = %session.id,
            used,
            budget,
            "Latest request exceeds the token budget"
        );
    }

    Payload {
        messages,
        tools: extras.tools.to_vec(),
        estimated_tokens: used,
        budget,
        dropped,
    }
}

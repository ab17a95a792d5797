//! History compaction.
//!
//! The oldest foldable block of messages is replaced by a single synthetic
//! system message. The most recent `min(keep_recent_max, max(2, len / 3))`
//! messages and the latest user message are always kept verbatim, and a
//! tool call is never separated from its results.
//!
//! The block is the history before the latest user message when that is
//! long enough to be worth folding. Otherwise it is the run of assistant
//! and tool messages between the latest user message and the kept tail,
//! which is what grows during a single long request.

use async_trait::async_trait;
use codeward_core::{
    Capabilities, CompletionProvider, CompletionRequest, Message, ProviderError, Role, Session,
};
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;

pub const SUMMARY_MARKER: &str = "[CONVERSATION SUMMARY]";

/// Sessions this short are never compacted.
const MIN_MESSAGES: usize = 5;
/// Smallest block worth replacing with a summary.
const MIN_FOLD: usize = 2;
const SNIPPET_CHARS: usize = 200;
/// Room given to an earlier summary carried into a new one.
const CARRIED_SUMMARY_CHARS: usize = 1000;
const FALLBACK_CAP_CHARS: usize = 2000;
const TRANSCRIPT_SNIPPET_CHARS: usize = 500;
const EMPTY_SUMMARY: &str = "[Previous conversation context was compacted.]";

const SUMMARY_PROMPT: &str = "Summarize the conversation below for a coding assistant that will continue it. \
Keep file paths, decisions, open tasks and any errors encountered. Be concise; use bullet points.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub messages_folded: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError>;
}

/// Deterministic summary: role-tagged snippets of user and assistant turns.
/// Earlier summaries in the folded block are carried forward in place, so
/// repeated compaction never drops what an earlier one kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackSummarizer;

impl FallbackSummarizer {
    pub fn summarize_now(messages: &[Message]) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut total = 0usize;
        for (idx, msg) in messages.iter().enumerate() {
            if let Some(earlier) = summary_body(msg) {
                let carried: String = earlier.chars().take(CARRIED_SUMMARY_CHARS).collect();
                if !carried.trim().is_empty() {
                    parts.push(carried.trim_end().to_string());
                }
                continue;
            }
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                _ => continue,
            };
            let mut snippet: String = msg.content.chars().take(SNIPPET_CHARS).collect();
            if snippet.trim().is_empty() {
                if msg.tool_calls.is_empty() {
                    continue;
                }
                let names: Vec<&str> = msg.tool_calls.iter().map(|c| c.name.as_str()).collect();
                snippet = format!("called {}", names.join(", "));
            }
            total += snippet.chars().count();
            parts.push(format!("- [{role}] {snippet}"));
            if total > FALLBACK_CAP_CHARS {
                let remaining = messages.len() - idx - 1;
                if remaining > 0 {
                    parts.push(format!("... ({remaining} more messages)"));
                }
                break;
            }
        }
        parts.join("\n")
    }
}

/// The body of a compaction summary message, without its marker.
pub fn summary_body(message: &Message) -> Option<&str> {
    if message.role != Role::System || !message.is_synthetic() {
        return None;
    }
    message.content.strip_prefix(SUMMARY_MARKER).map(str::trim_start)
}

#[async_trait]
impl Summarizer for FallbackSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError> {
        Ok(Self::summarize_now(messages))
    }
}

/// Completion-backed summaries.
pub struct ProviderSummarizer {
    provider: Arc<dyn CompletionProvider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let transcript: Vec<String> = messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| {
                let snippet: String = m.content.chars().take(TRANSCRIPT_SNIPPET_CHARS).collect();
                format!("[{:?}] {snippet}", m.role)
            })
            .collect();
        let caps = Capabilities {
            max_output_tokens: Some(1024),
            ..self.provider.capabilities()
        };
        let request = CompletionRequest::shaped(
            vec![Message::system(SUMMARY_PROMPT), Message::user(transcript.join("\n"))],
            Vec::new(),
            &caps,
            0.2,
        );
        let completion = self.provider.complete(request).await?;
        Ok(completion.text)
    }
}

/// The block of messages to fold, or `None` when there's nothing worth folding.
pub fn fold_boundary(session: &Session, keep_recent_max: usize) -> Option<Range<usize>> {
    let messages = &session.messages;
    let len = messages.len();
    if len < MIN_MESSAGES {
        return None;
    }
    let keep = keep_recent_max.min((len / 3).max(2));
    let mut end = len - keep;
    // Keep tool results with the call that produced them.
    while end > 0 && messages[end].role == Role::ToolResult {
        end -= 1;
    }

    let start = match session.latest_user_index() {
        Some(user) if user >= end => 0,
        Some(user) if user >= MIN_FOLD => {
            end = user;
            0
        }
        Some(user) => user + 1,
        None => 0,
    };
    (end >= start + MIN_FOLD).then_some(start..end)
}

/// The summary message that replaces a folded block.
pub fn summary_message(summary: &str, folded: usize) -> Message {
    let body = if summary.trim().is_empty() {
        EMPTY_SUMMARY
    } else {
        summary.trim()
    };
    Message::system(format!("{SUMMARY_MARKER}\n{body}"))
        .synthetic()
        .with_metadata("compacted_messages", serde_json::json!(folded))
}

/// Replace `messages[block]` with `summary` and move the context cursor past it.
pub fn apply(session: &mut Session, block: Range<usize>, summary: Message) {
    let start = block.start;
    session.messages.splice(block, std::iter::once(summary));
    session.context_cursor = start + 1;
    session.tokens.compactions += 1;
}

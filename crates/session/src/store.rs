//! The session/context store.
//!
//! Owns persistence, the summarizer used for compaction, and the shared
//! strategy book. Every mutation of a session goes through here and is
//! persisted before returning.

use crate::compaction::{self, CompactionReport, FallbackSummarizer, Summarizer};
use crate::payload::{self, Payload, PayloadExtras};
use crate::persistence::{SessionPersistence, SessionSummary};
use crate::strategy;
use crate::token;
use codeward_config::ContextSettings;
use codeward_core::{
    Message, Role, Session, SessionError, SessionId, Strategy, StrategyBook, StrategyTag, ToolCall,
    Usage,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TITLE_MAX_CHARS: usize = 50;
const SENTENCE_SCAN_CHARS: usize = 80;

pub struct SessionStore {
    persistence: Arc<dyn SessionPersistence>,
    settings: ContextSettings,
    summarizer: Arc<dyn Summarizer>,
    strategies: Mutex<Option<StrategyBook>>,
}

impl SessionStore {
    pub fn new(persistence: Arc<dyn SessionPersistence>, settings: ContextSettings) -> Self {
        Self {
            persistence,
            settings,
            summarizer: Arc::new(FallbackSummarizer),
            strategies: Mutex::new(None),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// The shared strategy book, loaded lazily.
    async fn shared_strategies(&self) -> Result<StrategyBook, SessionError> {
        let mut guard = self.strategies.lock().await;
        if let Some(book) = guard.as_ref() {
            return Ok(book.clone());
        }
        let book = self.persistence.load_strategies().await?;
        *guard = Some(book.clone());
        Ok(book)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// A fresh session seeded with the shared strategies. Not persisted
    /// until its first message.
    pub async fn create(&self) -> Result<Session, SessionError> {
        let mut session = Session::new();
        session.strategies = self.shared_strategies().await?;
        info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    pub async fn resume(&self, id: &SessionId) -> Result<Session, SessionError> {
        let mut session = self.persistence.load(id).await?;
        let shared = self.shared_strategies().await?;
        session.strategies.merge(&shared);
        session.tokens.estimated_context = token::estimate_messages_tokens(&session.messages);
        info!(session_id = %session.id, messages = session.messages.len(), "Session resumed");
        Ok(session)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        self.persistence.list().await
    }

    /// The most recently updated non-empty session.
    pub async fn latest(&self) -> Result<Option<Session>, SessionError> {
        match self.persistence.list().await?.first() {
            Some(summary) => self.resume(&summary.id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &SessionId) -> Result<bool, SessionError> {
        let deleted = self.persistence.delete(id).await?;
        if deleted {
            info!(session_id = %id, "Session deleted");
        }
        Ok(deleted)
    }

    pub async fn save(&self, session: &Session) -> Result<(), SessionError> {
        self.persistence.save(session).await
    }

    // ── History ───────────────────────────────────────────────────────────

    /// Append a message, refresh counters and title, and persist.
    pub async fn append(&self, session: &mut Session, message: Message) -> Result<(), SessionError> {
        if session.title.is_none() && message.role == Role::User {
            session.title = Some(generate_title(&message.content));
        }
        session.tokens.estimated_context += token::estimate_message_tokens(&message);
        session.messages.push(message);
        session.touch();
        self.persistence.save(session).await
    }

    /// Fold provider-reported usage into the session's counters.
    pub fn record_usage(&self, session: &mut Session, usage: Option<Usage>) {
        if let Some(usage) = usage {
            session.tokens.prompt_tokens += u64::from(usage.prompt_tokens);
            session.tokens.completion_tokens += u64::from(usage.completion_tokens);
        }
    }

    /// Estimated tokens have reached the compaction threshold.
    pub fn needs_compaction(&self, session: &Session) -> bool {
        let threshold = (self.settings.token_budget as f64 * f64::from(self.settings.compaction_threshold)) as usize;
        session.tokens.estimated_context >= threshold
    }

    /// Fold the oldest foldable block of history into a summary message.
    /// Returns `None` when there was nothing to fold.
    pub async fn compact(&self, session: &mut Session) -> Result<Option<CompactionReport>, SessionError> {
        let Some(block) = compaction::fold_boundary(session, self.settings.keep_recent_max) else {
            debug!(session_id = %session.id, "Nothing to compact");
            return Ok(None);
        };
        let tokens_before = token::estimate_messages_tokens(&session.messages);
        let folded = &session.messages[block.clone()];

        let summary = match self.summarizer.summarize(folded).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => FallbackSummarizer::summarize_now(folded),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Summarizer failed, using fallback summary");
                FallbackSummarizer::summarize_now(folded)
            }
        };
        let messages_folded = block.len();
        let block_start = block.start;
        compaction::apply(session, block, compaction::summary_message(&summary, messages_folded));

        let tokens_after = token::estimate_messages_tokens(&session.messages);
        session.tokens.estimated_context = tokens_after;
        session.touch();
        self.persistence.save(session).await?;

        info!(
            session_id = %session.id,
            folded = messages_folded,
            block_start,
            tokens_before,
            tokens_after,
            "Session compacted"
        );
        Ok(Some(CompactionReport {
            messages_folded,
            tokens_before,
            tokens_after,
        }))
    }

    /// Assemble the request payload. Never modifies the session.
    pub fn build_payload(&self, session: &Session, extras: &PayloadExtras<'_>) -> Payload {
        payload::build_payload(session, extras, self.settings.token_budget)
    }

    /// Payload extras preset with the configured strategy cap.
    pub fn extras<'a>(&self) -> PayloadExtras<'a> {
        PayloadExtras {
            strategy_cap: self.settings.strategy_cap,
            ..Default::default()
        }
    }

    // ── Strategies ────────────────────────────────────────────────────────

    pub fn reflect(&self, calls: &[ToolCall], run_succeeded: bool) -> Option<Strategy> {
        strategy::reflect(calls, run_succeeded, self.settings.reflection_confidence)
    }

    /// Record a strategy in the shared book and the session. Returns its id.
    pub async fn record_strategy(&self, session: &mut Session, strategy: Strategy) -> Result<String, SessionError> {
        let mut guard = self.strategies.lock().await;
        let mut book = match guard.take() {
            Some(book) => book,
            None => self.persistence.load_strategies().await?,
        };
        let id = book.add(strategy);
        let saved = self.persistence.save_strategies(&book).await;
        session.strategies.merge(&book);
        *guard = Some(book);
        saved?;
        self.persistence.save(session).await?;
        debug!(session_id = %session.id, strategy_id = %id, "Strategy recorded");
        Ok(id)
    }

    /// Tag a strategy helpful or harmful. Returns false for unknown ids.
    pub async fn tag_strategy(&self, session: &mut Session, id: &str, tag: StrategyTag) -> Result<bool, SessionError> {
        let mut guard = self.strategies.lock().await;
        let mut book = match guard.take() {
            Some(book) => book,
            None => self.persistence.load_strategies().await?,
        };
        let found = book.tag(id, tag);
        session.strategies.tag(id, tag);
        let saved = if found {
            self.persistence.save_strategies(&book).await
        } else {
            Ok(())
        };
        *guard = Some(book);
        saved?;
        self.persistence.save(session).await?;
        Ok(found)
    }
}

/// First sentence of the message, at most 50 chars; "Untitled" when empty.
pub fn generate_title(content: &str) -> String {
    let content = content.trim();
    let end = match content.find(['.', '\n', '?', '!']) {
        Some(idx) if idx > 0 && content[..idx].chars().count() < SENTENCE_SCAN_CHARS => idx,
        _ => content.len(),
    };
    let title: String = content[..end].chars().take(TITLE_MAX_CHARS).collect();
    let title = title.trim();
    if title.is_empty() {
        "Untitled".to_string()
    } else {
        title.to_string()
    }
}

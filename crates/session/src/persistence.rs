//! Session persistence backends.
//!
//! [`FilePersistence`] keeps one JSON document per session plus a shared
//! `strategies.json`, written atomically (temp file, then rename).
//! [`InMemoryPersistence`] is for tests and ephemeral runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codeward_core::{Role, Session, SessionError, SessionId, StrategyBook};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const STRATEGIES_FILE: &str = "strategies.json";

/// Listing metadata for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn of(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            message_count: session.messages.len(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Session, SessionError>;

    async fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// Returns whether the session existed.
    async fn delete(&self, id: &SessionId) -> Result<bool, SessionError>;

    /// Sessions with at least one user message, newest first.
    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError>;

    async fn load_strategies(&self) -> Result<StrategyBook, SessionError>;

    async fn save_strategies(&self, book: &StrategyBook) -> Result<(), SessionError>;
}

fn has_user_message(session: &Session) -> bool {
    session.messages.iter().any(|m| m.role == Role::User)
}

fn newest_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

// ── File backend ──────────────────────────────────────────────────────────

pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::NotFound(raw.to_string()));
        }
        Ok(self.dir.join(format!("{raw}.json")))
    }

    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to create {}: {e}", self.dir.display())))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to replace {}: {e}", path.display())))
    }
}

#[async_trait]
impl SessionPersistence for FilePersistence {
    async fn load(&self, id: &SessionId) -> Result<Session, SessionError> {
        let path = self.session_path(id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(id.to_string()));
            }
            Err(e) => return Err(SessionError::Storage(format!("Failed to read {}: {e}", path.display()))),
        };
        serde_json::from_str(&content).map_err(|e| SessionError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.session_path(&session.id)?;
        let bytes = serde_json::to_vec_pretty(session)
            .map_err(|e| SessionError::Storage(format!("Failed to serialize session: {e}")))?;
        self.write_atomic(&path, bytes).await?;
        debug!(session_id = %session.id, messages = session.messages.len(), "Session saved");
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, SessionError> {
        let path = self.session_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionError::Storage(format!("Failed to delete {}: {e}", path.display()))),
        }
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::Storage(format!("Failed to list {}: {e}", self.dir.display()))),
        };

        let mut summaries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let path = entry.path();
            let is_session = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != STRATEGIES_FILE);
            if !is_session {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<Session>(&content) {
                Ok(session) if has_user_message(&session) => summaries.push(SessionSummary::of(&session)),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn load_strategies(&self) -> Result<StrategyBook, SessionError> {
        let path = self.dir.join(STRATEGIES_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| SessionError::Corrupt {
                id: STRATEGIES_FILE.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StrategyBook::new()),
            Err(e) => Err(SessionError::Storage(format!("Failed to read {}: {e}", path.display()))),
        }
    }

    async fn save_strategies(&self, book: &StrategyBook) -> Result<(), SessionError> {
        let path = self.dir.join(STRATEGIES_FILE);
        let bytes = serde_json::to_vec_pretty(book)
            .map_err(|e| SessionError::Storage(format!("Failed to serialize strategies: {e}")))?;
        self.write_atomic(&path, bytes).await
    }
}

// ── In-memory backend ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryPersistence {
    sessions: RwLock<HashMap<SessionId, Session>>,
    strategies: RwLock<StrategyBook>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionPersistence for InMemoryPersistence {
    async fn load(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| has_user_message(s))
            .map(SessionSummary::of)
            .collect();
        newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn load_strategies(&self) -> Result<StrategyBook, SessionError> {
        Ok(self.strategies.read().await.clone())
    }

    async fn save_strategies(&self, book: &StrategyBook) -> Result<(), SessionError> {
        *self.strategies.write().await = book.clone();
        Ok(())
    }
}

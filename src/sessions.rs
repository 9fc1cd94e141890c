//! Per-client chat session persistence.
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::answer::AnswerEvent;
use crate::db::Db;
use crate::db::models::{ChatSession, Message, Role, SessionSummary, SourceCitation};
use crate::error::{RagError, Result};
use crate::registry::normalize_client_id;

const TITLE_MAX_CHARS: usize = 60;
const DEFAULT_TITLE: &str = "New conversation";

/// Title from the first line of the first user message.
#[must_use]
pub fn derive_title(messages: &[Message]) -> String {
    let Some(first) = messages
        .iter()
        .find(|m| m.role == Role::User && !m.content.trim().is_empty())
    else {
        return DEFAULT_TITLE.to_string();
    };

    let line = first.content.trim().lines().next().unwrap_or_default().trim();
    if line.chars().count() > TITLE_MAX_CHARS {
        let head: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head.trim_end())
    } else {
        line.to_string()
    }
}

pub struct SessionStore {
    db: Arc<Mutex<Db>>,
}

impl SessionStore {
    pub fn new(db: Arc<Mutex<Db>>) -> Self {
        Self { db }
    }

    fn db(&self) -> Result<MutexGuard<'_, Db>> {
        self.db
            .lock()
            .map_err(|_| RagError::Internal("catalog lock poisoned".to_string()))
    }

    fn known_client(db: &Db, client_id: &str) -> Result<String> {
        let id = normalize_client_id(client_id)?;
        if db.get_client(&id)?.is_none() {
            return Err(RagError::NotFound(format!("client '{id}'")));
        }
        Ok(id)
    }

    /// Create or replace a session. Returns its id.
    ///
    /// Without `session_id` a new UUID is generated. With one, the message
    /// list is replaced (the session is created if it does not exist).
    pub fn save(
        &self,
        client_id: &str,
        session_id: Option<&str>,
        title: Option<&str>,
        messages: &[Message],
    ) -> Result<String> {
        let mut db = self.db()?;
        let client_id = Self::known_client(&db, client_id)?;

        let session_id = match session_id.map(str::trim) {
            Some("") => {
                return Err(RagError::InvalidInput("empty session id".to_string()));
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map_or_else(|| derive_title(messages), str::to_string);

        db.save_session(&client_id, &session_id, &title, messages, Utc::now())?;
        debug!(
            "Saved session {session_id} for '{client_id}' ({} messages)",
            messages.len()
        );
        Ok(session_id)
    }

    /// Sessions of a client, newest-updated first.
    pub fn list(&self, client_id: &str) -> Result<Vec<SessionSummary>> {
        let db = self.db()?;
        let client_id = Self::known_client(&db, client_id)?;
        Ok(db.list_sessions(&client_id)?)
    }

    pub fn load(&self, client_id: &str, session_id: &str) -> Result<ChatSession> {
        let db = self.db()?;
        let client_id = Self::known_client(&db, client_id)?;
        db.load_session(&client_id, session_id)?
            .ok_or_else(|| RagError::NotFound(format!("session '{session_id}'")))
    }

    /// Append one question/answer exchange to a session under a single lock.
    ///
    /// A session that does not exist yet is created from `history` plus the
    /// exchange. An existing one only gains the exchange, so concurrent
    /// answers in the same session never overwrite each other.
    pub fn record_exchange(
        &self,
        client_id: &str,
        session_id: &str,
        history: &[Message],
        exchange: &[Message],
    ) -> Result<()> {
        let mut db = self.db()?;
        let client_id = Self::known_client(&db, client_id)?;
        if session_id.trim().is_empty() {
            return Err(RagError::InvalidInput("empty session id".to_string()));
        }

        let opening: Vec<Message> = history.iter().chain(exchange).cloned().collect();
        db.append_exchange(
            &client_id,
            session_id,
            &derive_title(&opening),
            history,
            exchange,
            Utc::now(),
        )?;
        debug!("Recorded exchange in session {session_id} for '{client_id}'");
        Ok(())
    }

    pub fn delete(&self, client_id: &str, session_id: &str) -> Result<()> {
        let db = self.db()?;
        let client_id = Self::known_client(&db, client_id)?;
        if !db.delete_session(&client_id, session_id)? {
            return Err(RagError::NotFound(format!("session '{session_id}'")));
        }
        Ok(())
    }
}

/// Watches an answer stream and appends the exchange to a session once the
/// stream reaches its terminal event.
pub struct ExchangeRecorder {
    store: Arc<SessionStore>,
    client_id: String,
    session_id: String,
    history: Vec<Message>,
    query: String,
    sources: Vec<SourceCitation>,
    answer: String,
    saved: bool,
}

impl ExchangeRecorder {
    /// `history` seeds a session that does not exist yet; `query` is the
    /// new user message.
    pub fn new(
        store: Arc<SessionStore>,
        client_id: &str,
        session_id: &str,
        history: Vec<Message>,
        query: &str,
    ) -> Self {
        Self {
            store,
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            history,
            query: query.to_string(),
            sources: Vec::new(),
            answer: String::new(),
            saved: false,
        }
    }

    /// Feed the next event. On the terminal event the exchange is written
    /// on the blocking pool; the returned handle resolves once it is stored.
    pub fn observe(&mut self, event: &AnswerEvent) -> Option<JoinHandle<()>> {
        match event {
            AnswerEvent::Metadata { sources } => {
                self.sources = sources.clone();
                None
            }
            AnswerEvent::Content { content } => {
                self.answer.push_str(content);
                None
            }
            AnswerEvent::Done => self.finish(None),
            AnswerEvent::Error { content } => self.finish(Some(content)),
        }
    }

    fn finish(&mut self, error: Option<&str>) -> Option<JoinHandle<()>> {
        if self.saved {
            return None;
        }
        self.saved = true;

        let content = match error {
            Some(fallback) if self.answer.is_empty() => fallback.to_string(),
            _ => std::mem::take(&mut self.answer),
        };
        let exchange = vec![
            Message::user(std::mem::take(&mut self.query)),
            Message::assistant(content, std::mem::take(&mut self.sources)),
        ];
        let history = std::mem::take(&mut self.history);
        let store = self.store.clone();
        let client_id = self.client_id.clone();
        let session_id = self.session_id.clone();

        Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = store.record_exchange(&client_id, &session_id, &history, &exchange) {
                warn!("Failed to record exchange in session {session_id}: {e}");
            }
        }))
    }
}

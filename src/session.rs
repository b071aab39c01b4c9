//! Session collaborator contract.
//!
//! Sessions are owned by an external subsystem (CRUD, auth, templates);
//! the execution core only reads a session's identity, language and
//! current working code. The in-memory directory exists for wiring and
//! tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// The slice of a session the execution core consumes.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,

    /// Preferred runtime for this session. `None` falls back to the
    /// service default at admission time.
    pub language: Option<String>,

    /// The session's current editable code. Admission snapshots the
    /// submitted text instead; this field never feeds a created execution.
    pub working_code: String,
}

/// Read access to sessions.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn get(&self, session_ref: &str) -> Option<SessionRecord>;
}

/// In-memory session directory.
#[derive(Debug, Default)]
pub struct InMemorySessions {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: SessionRecord) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(record.id.clone(), record);
    }

    /// Replace a session's working code (the "editor save" path).
    pub async fn update_code(&self, session_ref: &str, code: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(session_ref) {
            record.working_code = code.to_string();
        }
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessions {
    async fn get(&self, session_ref: &str) -> Option<SessionRecord> {
        let sessions = self.sessions.read().await;
        sessions.get(session_ref).cloned()
    }
}

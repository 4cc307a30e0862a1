//! Conversations, each with its own history, scoped state and approval gate.

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::persistence::{SessionRow, SqliteStore, StoreError};
use crate::state::{ScopeEntries, SessionState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tg_llm::{ChatMessage, Usage};
use tg_tools::ToolClassifier;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub usage_totals: Usage,
    #[serde(skip)]
    pub state: SessionState,
}

impl Session {
    pub(crate) fn new(user_id: &str, user_state: ScopeEntries) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            history: Vec::new(),
            created_at: now,
            last_active: now,
            usage_totals: Usage::default(),
            state: SessionState::restore(ScopeEntries::new(), user_state),
        }
    }

    pub fn add_usage(&mut self, usage: Usage) {
        self.usage_totals.prompt_tokens = self
            .usage_totals
            .prompt_tokens
            .saturating_add(usage.prompt_tokens);
        self.usage_totals.completion_tokens = self
            .usage_totals
            .completion_tokens
            .saturating_add(usage.completion_tokens);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session {0} already has a turn in progress")]
pub struct SessionBusy(pub Uuid);

/// Shared handle to one live session. The mutex is held for a whole turn.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: String,
    session: Arc<Mutex<Session>>,
    gate: Arc<ApprovalGate>,
}

impl SessionHandle {
    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Claim the session for one turn without waiting.
    pub fn try_begin_turn(&self) -> Result<OwnedMutexGuard<Session>, SessionBusy> {
        self.session
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionBusy(self.id))
    }

    /// Read the session if no turn currently holds it.
    pub fn peek<T>(&self, f: impl FnOnce(&Session) -> T) -> Result<T, SessionBusy> {
        let guard = self.session.try_lock().map_err(|_| SessionBusy(self.id))?;
        Ok(f(&guard))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub user_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub messages: Option<usize>,
    pub turn_in_progress: bool,
    pub pending_approvals: usize,
}

pub struct SessionManager {
    sessions: DashMap<Uuid, SessionHandle>,
    users: DashMap<String, ScopeEntries>,
    classifier: Arc<ToolClassifier>,
    store: Option<SqliteStore>,
}

impl SessionManager {
    pub async fn load_or_new(
        classifier: Arc<ToolClassifier>,
        store: Option<SqliteStore>,
    ) -> Result<Self, StoreError> {
        let manager = Self {
            sessions: DashMap::new(),
            users: DashMap::new(),
            classifier,
            store,
        };
        manager.load_from_store().await?;
        Ok(manager)
    }

    async fn load_from_store(&self) -> Result<(), StoreError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let data = store.load().await?;
        for (user_id, entries) in data.users {
            self.users.insert(user_id, entries);
        }
        for row in data.sessions {
            let mut session: Session = serde_json::from_str(&row.session_json)?;
            let user_state = self
                .users
                .get(&row.user_id)
                .map(|u| u.value().clone())
                .unwrap_or_default();
            session.state = SessionState::restore(row.state, user_state);
            self.insert(session);
        }
        tracing::info!(sessions = self.sessions.len(), "sessions restored");
        Ok(())
    }

    fn insert(&self, session: Session) -> SessionHandle {
        let handle = SessionHandle {
            id: session.id,
            user_id: session.user_id.clone(),
            session: Arc::new(Mutex::new(session)),
            gate: Arc::new(ApprovalGate::new(self.classifier.clone())),
        };
        self.sessions.insert(handle.id, handle.clone());
        handle
    }

    pub async fn create(&self, user_id: &str) -> Result<SessionHandle, StoreError> {
        let user_state = self
            .users
            .get(user_id)
            .map(|u| u.value().clone())
            .unwrap_or_default();
        let session = Session::new(user_id, user_state);
        self.commit(&session).await?;
        let handle = self.insert(session);
        tracing::info!(session_id = %handle.id, user_id, "session created");
        Ok(handle)
    }

    pub fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<SessionSummary> = handles
            .into_iter()
            .map(|handle| {
                let pending_approvals = handle.gate.pending().len();
                match handle.peek(|s| (s.created_at, s.last_active, s.history.len())) {
                    Ok((created_at, last_active, messages)) => SessionSummary {
                        id: handle.id,
                        user_id: handle.user_id.clone(),
                        created_at: Some(created_at),
                        last_active: Some(last_active),
                        messages: Some(messages),
                        turn_in_progress: false,
                        pending_approvals,
                    },
                    Err(_) => SessionSummary {
                        id: handle.id,
                        user_id: handle.user_id.clone(),
                        created_at: None,
                        last_active: None,
                        messages: None,
                        turn_in_progress: true,
                        pending_approvals,
                    },
                }
            })
            .collect();
        out.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        out
    }

    /// Drop a session. Pending approvals are denied so a running turn can finish.
    pub async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some((_, handle)) = self.sessions.remove(&id) else {
            return Ok(false);
        };
        for pending in handle.gate.pending() {
            let _ = handle.gate.resolve(ApprovalDecision::deny(
                pending.request.invocation_id,
                Some("session deleted".to_string()),
            ));
        }
        if let Some(store) = self.store.as_ref() {
            store.delete(id).await?;
        }
        tracing::info!(session_id = %id, "session deleted");
        Ok(true)
    }

    /// Publish the session's `user:` entries to the user's other sessions'
    /// future view and write both persistent scopes to the store.
    pub async fn commit(&self, session: &Session) -> Result<(), StoreError> {
        let user_state = session.state.user_entries().clone();
        self.users
            .insert(session.user_id.clone(), user_state.clone());
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let row = SessionRow {
            id: session.id,
            user_id: session.user_id.clone(),
            session_json: serde_json::to_string(session)?,
            state: session.state.session_entries().clone(),
        };
        store.save(row, user_state).await
    }
}

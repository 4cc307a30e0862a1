//! Scope-partitioned key/value state for one conversation.
//!
//! Keys live in one of three scopes: `temp:` (one invocation cycle, never
//! persisted), `session:` (the conversation) and `user:` (shared by every
//! conversation of the same user). Reading an absent key is never an error;
//! callers pick their own default, see [`counter_value`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Temp,
    Session,
    User,
}

impl Scope {
    pub fn prefix(self) -> &'static str {
        match self {
            Scope::Temp => "temp:",
            Scope::Session => "session:",
            Scope::User => "user:",
        }
    }

    /// Split a qualified key such as `temp:tool_count`.
    pub fn split_key(qualified: &str) -> Result<(Scope, &str), StateKeyError> {
        for scope in [Scope::Temp, Scope::Session, Scope::User] {
            if let Some(key) = qualified.strip_prefix(scope.prefix()) {
                if key.is_empty() {
                    return Err(StateKeyError::EmptyKey(qualified.to_string()));
                }
                return Ok((scope, key));
            }
        }
        Err(StateKeyError::UnknownScope(qualified.to_string()))
    }

    pub fn qualify(self, key: &str) -> String {
        format!("{}{key}", self.prefix())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateKeyError {
    #[error("state key {0:?} has no temp:, session: or user: prefix")]
    UnknownScope(String),
    #[error("state key {0:?} is empty after its scope prefix")]
    EmptyKey(String),
}

/// One write, as observed by the orchestration loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub scope: Scope,
    pub key: String,
    pub value: serde_json::Value,
}

pub type ScopeEntries = BTreeMap<String, serde_json::Value>;

/// Each `get`/`set` stands alone; nothing here groups writes to several keys.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    temp: ScopeEntries,
    session: ScopeEntries,
    user: ScopeEntries,
    changes: Vec<StateChange>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted `session:` and `user:` entries. `temp:` always starts empty.
    pub fn restore(session: ScopeEntries, user: ScopeEntries) -> Self {
        Self {
            temp: ScopeEntries::new(),
            session,
            user,
            changes: Vec::new(),
        }
    }

    fn entries(&self, scope: Scope) -> &ScopeEntries {
        match scope {
            Scope::Temp => &self.temp,
            Scope::Session => &self.session,
            Scope::User => &self.user,
        }
    }

    fn entries_mut(&mut self, scope: Scope) -> &mut ScopeEntries {
        match scope {
            Scope::Temp => &mut self.temp,
            Scope::Session => &mut self.session,
            Scope::User => &mut self.user,
        }
    }

    pub fn get(&self, scope: Scope, key: &str) -> Option<&serde_json::Value> {
        self.entries(scope).get(key)
    }

    pub fn set(&mut self, scope: Scope, key: &str, value: serde_json::Value) {
        self.entries_mut(scope)
            .insert(key.to_string(), value.clone());
        self.changes.push(StateChange {
            scope,
            key: key.to_string(),
            value,
        });
    }

    /// `get` addressed by a qualified key such as `session:turn_count`.
    pub fn get_qualified(&self, qualified: &str) -> Result<Option<&serde_json::Value>, StateKeyError> {
        let (scope, key) = Scope::split_key(qualified)?;
        Ok(self.get(scope, key))
    }

    /// Start of an invocation cycle: every `temp:` key becomes absent again.
    pub fn begin_cycle(&mut self) {
        self.temp.clear();
    }

    /// End of an invocation cycle. Unobserved changes to `temp:` are dropped with the keys.
    pub fn end_cycle(&mut self) {
        self.temp.clear();
        self.changes.retain(|c| c.scope != Scope::Temp);
    }

    /// Writes since the last call, oldest first.
    pub fn take_changes(&mut self) -> Vec<StateChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn session_entries(&self) -> &ScopeEntries {
        &self.session
    }

    pub fn user_entries(&self) -> &ScopeEntries {
        &self.user
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "temp": self.temp,
            "session": self.session,
            "user": self.user,
        })
    }
}

/// Numeric view of a possibly absent value. Absent or non-integer reads as 0.
pub fn counter_value(value: Option<&serde_json::Value>) -> i64 {
    value.and_then(serde_json::Value::as_i64).unwrap_or(0)
}

/// String-list view of a possibly absent value. Absent or malformed reads as empty.
pub fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use rlm_core::{SessionId, SessionState};

/// One engine session in the call tree.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: SessionId,
    /// The session whose sub-call created this one. `None` for roots.
    pub parent: Option<SessionId>,
    pub depth: u32,
    pub label: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Arena of every session created by a runtime, indexed by id.
///
/// Engines hold ids, never references to each other; parent/child structure
/// lives here.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, parent: Option<SessionId>, depth: u32, label: impl Into<String>) -> SessionId {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            parent,
            depth,
            label: label.into(),
            state: SessionState::Running,
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = record.id;
        self.sessions.write().insert(id, record);
        id
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(record) = self.sessions.write().get_mut(&id) {
            record.state = state;
            if state.is_terminal() {
                record.finished_at = Some(Utc::now());
            }
        }
    }

    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.read().get(&id).cloned()
    }

    /// Direct children of `id`, oldest first.
    pub fn children(&self, id: SessionId) -> Vec<SessionRecord> {
        let mut children: Vec<SessionRecord> = self
            .sessions
            .read()
            .values()
            .filter(|r| r.parent == Some(id))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.created_at);
        children
    }

    /// `id` and all of its descendants.
    pub fn subtree(&self, id: SessionId) -> Vec<SessionRecord> {
        let sessions = self.sessions.read();
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(record) = sessions.get(&current) {
                out.push(record.clone());
            }
            stack.extend(
                sessions
                    .values()
                    .filter(|r| r.parent == Some(current))
                    .map(|r| r.id),
            );
        }
        out
    }

    /// Drop `id` and all of its descendants.
    pub fn remove_tree(&self, id: SessionId) -> usize {
        let ids: Vec<SessionId> = self.subtree(id).into_iter().map(|r| r.id).collect();
        let mut sessions = self.sessions.write();
        for id in &ids {
            sessions.remove(id);
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let mut all: Vec<SessionRecord> = self.sessions.read().values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }
}

//! Creation sessions and their externally visible status

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Live,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub app_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Status as seen at `now`; a live session turns expired with its app
    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        match self.status {
            SessionStatus::Live | SessionStatus::Creating if now >= self.expires_at => SessionStatus::Expired,
            status => status,
        }
    }
}

/// Sessions keyed by session id
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    retention: chrono::Duration,
}

impl SessionStore {
    /// `retention` is how long a session stays queryable after expiry
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            retention: chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Record a new session in `creating` state and return its id
    pub fn open(&self, app_id: &str, user_id: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                app_id: app_id.to_string(),
                user_id: user_id.to_string(),
                status: SessionStatus::Creating,
                created_at: now,
                expires_at,
            },
        );
        session_id
    }

    /// Settle a `creating` session. Later calls are ignored.
    pub fn settle(&self, session_id: &str, status: SessionStatus) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if session.status != SessionStatus::Creating {
            return false;
        }
        session.status = status;
        debug!(session_id, app_id = %session.app_id, ?status, "Session settled");
        true
    }

    /// Snapshot of a session with its status derived at `now`
    pub fn get(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        self.sessions.get(session_id).map(|entry| {
            let mut session = entry.value().clone();
            session.status = session.status_at(now);
            session
        })
    }

    /// Drop sessions whose retention window has passed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        let retention = self.retention;
        self.sessions.retain(|_, session| {
            let done_at = match session.status {
                // Failed sessions count from creation
                SessionStatus::Failed => session.created_at,
                _ => session.expires_at,
            };
            now < done_at + retention
        });
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

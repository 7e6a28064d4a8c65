//! Per-session conversation history with a bounded message cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::message::{ChatMessage, Role};

/// Most recent messages retained per session; older turns are dropped.
pub const MAX_SESSION_MESSAGES: usize = 20;

/// Listing row describing one live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Number of retained messages.
    pub message_count: usize,
    /// Timestamp of the most recent message, when any exist.
    pub last_activity: Option<String>,
}

/// In-memory session registry. Histories live for the process lifetime only;
/// the guarded map serializes concurrent appends so none are lost.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
    id_seq: AtomicU64,
}

impl SessionStore {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            id_seq: AtomicU64::new(0),
        }
    }

    /// Synthesizes a fresh session id from the current time plus a
    /// process-wide sequence suffix, so ids minted within the same
    /// millisecond still differ.
    pub fn next_session_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("session_{}_{}", Utc::now().timestamp_millis(), seq)
    }

    /// Appends a message, then truncates the history to the most recent
    /// [`MAX_SESSION_MESSAGES`] entries (oldest dropped first; user and
    /// assistant turns are not paired across the cutoff).
    pub async fn append(&self, session_id: &str, role: Role, content: &str) {
        let mut sessions = self.sessions.lock().await;
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push(ChatMessage::now(role, content));
        if history.len() > MAX_SESSION_MESSAGES {
            let excess = history.len() - MAX_SESSION_MESSAGES;
            history.drain(..excess);
        }
    }

    /// Retained history for the session; empty when the session is unknown.
    pub async fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    /// Destroys the session and its history. Returns whether it existed.
    pub async fn clear(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    /// One summary per live session.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .map(|(session_id, history)| SessionSummary {
                session_id: session_id.clone(),
                message_count: history.len(),
                last_activity: history.last().map(|message| message.timestamp.clone()),
            })
            .collect()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

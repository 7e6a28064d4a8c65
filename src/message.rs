//! Chat message primitives shared by sessions, agents, and the wire layer.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Speaker role attached to every chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructional system prompt.
    System,
    /// End-user turn.
    User,
    /// Model-generated turn.
    Assistant,
}

impl Role {
    /// Wire-format name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation. Append-only: never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced the turn.
    pub role: Role,
    /// Turn text.
    pub content: String,
    /// RFC 3339 creation timestamp.
    pub timestamp: String,
}

impl ChatMessage {
    /// Builds a message stamped with the current time.
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Rough token estimate for a text: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

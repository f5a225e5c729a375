use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    /// Wall-clock time from submission to response, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Some(OffsetDateTime::now_utc()),
            latency_ms: None,
            tokens_per_second: None,
            token_count: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn with_token_count(mut self, token_count: Option<usize>) -> Self {
        self.token_count = token_count;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    /// A fresh session seeded with a single system message.
    pub fn new(system_prompt: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            messages: vec![ChatMessage::system(system_prompt)],
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.touch();
    }

    pub fn touch(&mut self) {
        let now = OffsetDateTime::now_utc();
        // Keep updated_at monotonic even if the wall clock steps backwards.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + time::Duration::microseconds(1)
        };
    }

    /// Derived from the first user message; `None` until the user has spoken.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        let first = self
            .messages
            .iter()
            .find(|message| message.role == Role::User)?;
        let trimmed = first.content.trim();
        if trimmed.chars().count() > TITLE_MAX_CHARS {
            let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
            Some(format!("{}...", head.trim_end()))
        } else {
            Some(trimmed.to_string())
        }
    }

    #[must_use]
    pub fn display_title(&self) -> String {
        self.title().unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }
}

/// Lightweight listing row for session pickers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub message_count: usize,
    pub active: bool,
}

//! Text chat with Bill: conversation model and the `generateContent` client.

pub mod client;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[allow(unused_imports)]
pub use client::{ChatClient, ChatError, ChatReply, GenerationOptions};

/// Reply shown in place of an answer when a request fails.
pub const ERROR_REPLY: &str = "Συγγνώμη, συνέβη ένα σφάλμα. Παρακαλώ δοκιμάστε ξανά.";

/// Title used until the first user message arrives.
pub const UNTITLED: &str = "Νέα συζήτηση";

const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Web page the model grounded an answer on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSource {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SearchSource>,
    /// Base64 image (raw or `data:` URL) attached by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sources: Vec::new(),
            attachment: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    pub fn with_sources(mut self, sources: Vec<SearchSource>) -> Self {
        self.sources = sources;
        self
    }
}

/// One conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: UNTITLED.to_string(),
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append a message; the first user message names the session.
    pub fn push(&mut self, message: Message) {
        if self.title == UNTITLED && message.role == Role::User {
            if let Some(title) = derive_title(&message.content) {
                self.title = title;
            }
        }
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.title = UNTITLED.to_string();
    }

    /// Send `message` with the full history and append the reply.
    ///
    /// A failed request still appends [`ERROR_REPLY`] so the transcript
    /// shows the attempt; the error is returned to the caller.
    pub async fn exchange(
        &mut self,
        client: &ChatClient,
        message: Message,
        options: &GenerationOptions,
    ) -> Result<Message, ChatError> {
        self.push(message);
        let result = client.send_message(&self.messages, options).await;
        let reply = match &result {
            Ok(reply) => Message::assistant(reply.text.clone()).with_sources(reply.sources.clone()),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Chat request failed");
                Message::assistant(ERROR_REPLY)
            }
        };
        self.messages.push(reply.clone());
        result.map(|_| reply)
    }
}

/// First line of `content`, shortened to a title.
fn derive_title(content: &str) -> Option<String> {
    let line = content.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= TITLE_MAX_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    Some(format!("{}…", cut.trim_end()))
}

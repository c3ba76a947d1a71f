use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, Role};

pub const DEFAULT_TITLE: &str = "New Conversation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Documents uploaded to the retrieval service from this conversation.
    #[serde(default)]
    pub rag_document_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(greeting: Option<&str>) -> Self {
        let now = Utc::now();
        let messages = greeting
            .filter(|g| !g.trim().is_empty())
            .map(|g| vec![Message::new(Role::System, g)])
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages,
            rag_document_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.role == Role::User)
    }

    pub fn last_message_preview(&self) -> Option<String> {
        self.messages
            .last()
            .map(|m| m.content.chars().take(100).collect())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

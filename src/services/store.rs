use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::{Conversation, Message, MessageVersion, PendingFile};
use crate::services::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVariant {
    Local,
    Backend,
}

/// Where conversations live. The in-memory store mirrors every change here.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    fn variant(&self) -> StorageVariant;

    /// All conversations, most recently updated first.
    async fn load_conversations(&self) -> Result<Vec<Conversation>>;

    /// Persist a new conversation and the messages it already carries.
    /// Returns the conversation as stored, which may carry server-assigned ids.
    async fn create_conversation(&self, conversation: &Conversation) -> Result<Conversation>;

    /// Persist title and retrieval document ids.
    async fn update_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn delete_conversation(&self, id: &str) -> Result<()>;

    /// Persist a message. `files` are the raw bytes behind `message.files`,
    /// for repositories that upload them.
    async fn append_message(
        &self,
        conversation_id: &str,
        message: &Message,
        files: &[PendingFile],
    ) -> Result<Message>;

    /// Persist new content for a message, keeping `previous_content` as a version.
    async fn update_message(
        &self,
        conversation_id: &str,
        message: &Message,
        previous_content: &str,
    ) -> Result<()>;

    async fn delete_messages(&self, conversation_id: &str, ids: &[String]) -> Result<()>;

    /// Versions of a message, newest first.
    async fn list_versions(&self, message_id: &str) -> Result<Vec<MessageVersion>>;
}

/// Repository backed by the local SQLite database.
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationRepository for LocalStore {
    fn variant(&self) -> StorageVariant {
        StorageVariant::Local
    }

    async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.db
            .load_conversations()
            .await
            .context("Failed to load conversations")
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<Conversation> {
        self.db
            .insert_conversation(conversation)
            .await
            .context("Failed to save conversation")?;
        Ok(conversation.clone())
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.db
            .update_conversation(conversation)
            .await
            .context("Failed to update conversation")
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.db
            .delete_conversation(id)
            .await
            .context("Failed to delete conversation")
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: &Message,
        _files: &[PendingFile],
    ) -> Result<Message> {
        self.db
            .insert_message(conversation_id, message)
            .await
            .context("Failed to save message")?;
        Ok(message.clone())
    }

    async fn update_message(
        &self,
        _conversation_id: &str,
        message: &Message,
        previous_content: &str,
    ) -> Result<()> {
        let version = MessageVersion::new(&message.id, previous_content);
        self.db
            .update_message_content(&message.id, &message.content, &version)
            .await
            .context("Failed to update message")
    }

    async fn delete_messages(&self, conversation_id: &str, ids: &[String]) -> Result<()> {
        self.db
            .delete_messages(conversation_id, ids)
            .await
            .context("Failed to delete messages")
    }

    async fn list_versions(&self, message_id: &str) -> Result<Vec<MessageVersion>> {
        self.db
            .list_versions(message_id)
            .await
            .context("Failed to load message versions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[tokio::test]
    async fn test_local_store_edit_records_version() {
        let store = LocalStore::new(Database::new_in_memory().unwrap());
        let conv = store
            .create_conversation(&Conversation::new(Some("Hi")))
            .await
            .unwrap();

        let mut msg = Message::new(Role::User, "first");
        store.append_message(&conv.id, &msg, &[]).await.unwrap();
        msg.content = "second".to_string();
        store.update_message(&conv.id, &msg, "first").await.unwrap();

        let versions = store.list_versions(&msg.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content, "first");

        let loaded = store.load_conversations().await.unwrap();
        assert_eq!(loaded[0].messages[1].content, "second");
    }
}

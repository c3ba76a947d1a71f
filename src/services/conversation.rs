use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{PipelineError, Result};
use crate::models::{Conversation, Message, MessageVersion, PendingFile, Role};
use crate::services::database::Database;
use crate::services::events::{ChatEvent, EventSink, Severity};
use crate::services::store::{ConversationRepository, StorageVariant};

const SELECTED_KEY: &str = "current_conversation_id";
const TITLE_LEN: usize = 30;

#[derive(Default)]
struct StoreState {
    conversations: Vec<Conversation>,
    selected: Option<String>,
    /// Bumped on every mutation; replies computed against an older value are stale.
    generations: HashMap<String, u64>,
}

impl StoreState {
    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| PipelineError::ConversationNotFound(id.to_string()))
    }

    fn bump(&mut self, id: &str) -> u64 {
        let generation = self.generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn generation(&self, id: &str) -> u64 {
        self.generations.get(id).copied().unwrap_or(0)
    }

    /// Conversations in display order: most recently updated first.
    fn sorted(&self) -> Vec<Conversation> {
        let mut conversations = self.conversations.clone();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }
}

/// In-memory conversations mirrored to a repository.
pub struct ConversationStore {
    repo: Arc<dyn ConversationRepository>,
    db: Database,
    greeting: Option<String>,
    events: EventSink,
    state: Mutex<StoreState>,
}

impl ConversationStore {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        db: Database,
        greeting: Option<String>,
        events: EventSink,
    ) -> Self {
        Self {
            repo,
            db,
            greeting,
            events,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn variant(&self) -> StorageVariant {
        self.repo.variant()
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    fn report_storage_error(&self, action: &str, e: &anyhow::Error) {
        tracing::error!("Failed to {}: {:#}", action, e);
        self.events.notice(
            Severity::Error,
            "Storage error",
            format!("Failed to {}: {:#}", action, e),
        );
    }

    async fn persist_selection(&self, id: Option<&str>) {
        let result = match id {
            Some(id) => self.db.set_setting(SELECTED_KEY, id).await,
            None => self.db.delete_setting(SELECTED_KEY).await,
        };
        if let Err(e) = result {
            self.report_storage_error("save the selected conversation", &e);
        }
    }

    /// Load conversations and restore the previously selected one.
    pub async fn load(&self) -> Result<()> {
        let mut conversations = self.repo.load_conversations().await?;
        if self.variant() == StorageVariant::Backend {
            match self.db.list_conversation_documents().await {
                Ok(mut documents) => {
                    for conv in &mut conversations {
                        if let Some(ids) = documents.remove(&conv.id) {
                            conv.rag_document_ids = ids;
                        }
                    }
                }
                Err(e) => self.report_storage_error("load the conversations' documents", &e),
            }
        }
        let saved = match self.db.get_setting(SELECTED_KEY).await {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!("Failed to read selected conversation: {}", e);
                None
            }
        };

        let selected = {
            let mut state = self.lock();
            state.conversations = conversations;
            state.generations.clear();
            let selected = saved
                .filter(|id| state.conversations.iter().any(|c| &c.id == id))
                .or_else(|| state.sorted().first().map(|c| c.id.clone()));
            state.selected = selected.clone();
            selected
        };

        tracing::debug!("Loaded conversations, selected {:?}", selected);
        Ok(())
    }

    pub fn list(&self) -> Vec<Conversation> {
        self.lock().sorted()
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.lock().conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn selected_id(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    pub fn selected(&self) -> Option<Conversation> {
        let state = self.lock();
        let id = state.selected.as_deref()?;
        state.conversations.iter().find(|c| c.id == id).cloned()
    }

    /// Start a new conversation and select it.
    pub async fn create(&self) -> Result<Conversation> {
        let draft = Conversation::new(self.greeting.as_deref());
        let stored = self.repo.create_conversation(&draft).await?;
        self.insert(stored.clone()).await;
        tracing::info!("Created conversation {}", stored.id);
        Ok(stored)
    }

    /// Add an already-persisted conversation and select it.
    pub(crate) async fn insert(&self, conversation: Conversation) {
        let id = conversation.id.clone();
        {
            let mut state = self.lock();
            state.conversations.push(conversation);
            state.selected = Some(id.clone());
        }
        self.persist_selection(Some(&id)).await;
        self.events.emit(ChatEvent::ConversationUpdated { conversation_id: id });
    }

    pub async fn select(&self, id: &str) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.conversations.iter().any(|c| c.id == id) {
                return Err(PipelineError::ConversationNotFound(id.to_string()));
            }
            state.selected = Some(id.to_string());
        }
        self.persist_selection(Some(id)).await;
        Ok(())
    }

    /// Delete a conversation. If it was selected, the next one in display order is.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let (was_selected, next) = {
            let mut state = self.lock();
            let before = state.conversations.len();
            state.conversations.retain(|c| c.id != id);
            if state.conversations.len() == before {
                return Err(PipelineError::ConversationNotFound(id.to_string()));
            }
            state.generations.remove(id);
            let was_selected = state.selected.as_deref() == Some(id);
            if was_selected {
                state.selected = state.sorted().first().map(|c| c.id.clone());
            }
            (was_selected, state.selected.clone())
        };

        if was_selected {
            self.persist_selection(next.as_deref()).await;
        }
        if let Err(e) = self.repo.delete_conversation(id).await {
            self.report_storage_error("delete the conversation", &e);
        }
        if self.variant() == StorageVariant::Backend {
            if let Err(e) = self.db.delete_conversation_documents(id).await {
                self.report_storage_error("delete the conversation's documents", &e);
            }
        }
        tracing::info!("Deleted conversation {}", id);
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: id.to_string(),
        });
        Ok(())
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(PipelineError::EmptyTitle);
        }
        let snapshot = {
            let mut state = self.lock();
            let conv = state.conversation_mut(id)?;
            conv.title = title.to_string();
            conv.touch();
            conv.clone()
        };
        self.save_conversation(&snapshot).await;
        Ok(())
    }

    /// Copy a whole conversation into a new one and select the copy.
    pub async fn fork(&self, id: &str) -> Result<Conversation> {
        let source = self
            .get(id)
            .ok_or_else(|| PipelineError::ConversationNotFound(id.to_string()))?;
        self.fork_with(&source, source.messages.len()).await
    }

    /// New conversation holding the first `prefix_len` messages of `source`.
    pub(crate) async fn fork_with(
        &self,
        source: &Conversation,
        prefix_len: usize,
    ) -> Result<Conversation> {
        let mut draft = Conversation::new(None);
        draft.title = fork_title(&source.title);
        draft.messages = source.messages[..prefix_len.min(source.messages.len())]
            .iter()
            .map(Message::duplicate)
            .collect();

        let stored = self.repo.create_conversation(&draft).await?;
        self.insert(stored.clone()).await;
        tracing::info!("Forked conversation {} into {}", source.id, stored.id);
        Ok(stored)
    }

    async fn save_conversation(&self, conversation: &Conversation) {
        if let Err(e) = self.repo.update_conversation(conversation).await {
            self.report_storage_error("update the conversation", &e);
        }
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation.id.clone(),
        });
    }

    /// Conversation holding `message_id`, with the message's index in it.
    pub(crate) fn locate(&self, message_id: &str) -> Option<(Conversation, usize)> {
        let state = self.lock();
        state.conversations.iter().find_map(|c| {
            c.position(message_id).map(|index| (c.clone(), index))
        })
    }

    /// Messages of a conversation with its current generation.
    pub(crate) fn history(&self, conversation_id: &str) -> Result<(Vec<Message>, u64)> {
        let state = self.lock();
        let conv = state
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| PipelineError::ConversationNotFound(conversation_id.to_string()))?;
        Ok((conv.messages.clone(), state.generation(conversation_id)))
    }

    /// Append a message, show it, then persist it.
    pub(crate) async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
        files: &[PendingFile],
    ) -> Result<Message> {
        {
            let mut state = self.lock();
            let conv = state.conversation_mut(conversation_id)?;
            conv.messages.push(message.clone());
            conv.touch();
            state.bump(conversation_id);
        }
        Ok(self.persist_appended(conversation_id, message, files).await)
    }

    async fn persist_appended(
        &self,
        conversation_id: &str,
        message: Message,
        files: &[PendingFile],
    ) -> Message {
        self.events.emit(ChatEvent::MessageAdded {
            conversation_id: conversation_id.to_string(),
            message: message.clone(),
        });

        match self.repo.append_message(conversation_id, &message, files).await {
            Ok(stored) => {
                if stored != message {
                    let mut state = self.lock();
                    if let Ok(conv) = state.conversation_mut(conversation_id) {
                        if let Some(slot) = conv.messages.iter_mut().find(|m| m.id == message.id) {
                            *slot = stored.clone();
                        }
                    }
                }
                stored
            }
            Err(e) => {
                self.report_storage_error("save the message", &e);
                message
            }
        }
    }

    /// Apply a completion result if nothing changed since `generation` was taken.
    pub(crate) async fn apply_reply(
        &self,
        conversation_id: &str,
        generation: u64,
        message: Message,
    ) -> Result<Message> {
        let retitled = {
            let mut state = self.lock();
            let current = state.generation(conversation_id);
            let exists = state.conversations.iter().any(|c| c.id == conversation_id);
            if !exists || current != generation {
                drop(state);
                tracing::info!(
                    "Discarding stale reply for conversation {} (generation {} != {})",
                    conversation_id,
                    generation,
                    current
                );
                self.events.emit(ChatEvent::ReplyDiscarded {
                    conversation_id: conversation_id.to_string(),
                });
                return Err(PipelineError::Superseded);
            }

            let conv = state.conversation_mut(conversation_id)?;
            conv.messages.push(message.clone());
            conv.touch();
            let new_title = if conv.has_default_title() {
                conv.first_user_message()
                    .map(|m| truncate_title(&m.content))
                    .filter(|t| !t.is_empty())
            } else {
                None
            };
            let retitled = new_title.map(|title| {
                conv.title = title;
                conv.clone()
            });
            state.bump(conversation_id);
            retitled
        };

        let stored = self.persist_appended(conversation_id, message, &[]).await;
        if let Some(conv) = retitled {
            self.save_conversation(&conv).await;
        }
        Ok(stored)
    }

    /// Replace a message's content, optionally dropping every later message.
    pub(crate) async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        truncate: bool,
    ) -> Result<Message> {
        let (updated, previous, removed) = {
            let mut state = self.lock();
            let conv = state.conversation_mut(conversation_id)?;
            let index = conv
                .position(message_id)
                .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
            let previous = std::mem::replace(&mut conv.messages[index].content, content.to_string());
            let updated = conv.messages[index].clone();
            let removed: Vec<String> = if truncate {
                conv.messages.drain(index + 1..).map(|m| m.id).collect()
            } else {
                Vec::new()
            };
            conv.touch();
            state.bump(conversation_id);
            (updated, previous, removed)
        };

        if let Err(e) = self.repo.update_message(conversation_id, &updated, &previous).await {
            self.report_storage_error("save the edited message", &e);
        }
        self.delete_persisted(conversation_id, &removed).await;
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
        Ok(updated)
    }

    /// Remove the given messages from a conversation.
    pub(crate) async fn remove_messages(&self, conversation_id: &str, ids: &[String]) -> Result<()> {
        {
            let mut state = self.lock();
            let conv = state.conversation_mut(conversation_id)?;
            conv.messages.retain(|m| !ids.contains(&m.id));
            conv.touch();
            state.bump(conversation_id);
        }
        self.delete_persisted(conversation_id, ids).await;
        self.events.emit(ChatEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Remove the message at `index` and everything after it.
    pub(crate) async fn truncate_from(&self, conversation_id: &str, index: usize) -> Result<()> {
        let ids: Vec<String> = {
            let state = self.lock();
            let conv = state
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .ok_or_else(|| PipelineError::ConversationNotFound(conversation_id.to_string()))?;
            conv.messages.iter().skip(index).map(|m| m.id.clone()).collect()
        };
        self.remove_messages(conversation_id, &ids).await
    }

    async fn delete_persisted(&self, conversation_id: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.repo.delete_messages(conversation_id, ids).await {
            self.report_storage_error("delete messages", &e);
        }
    }

    /// Record retrieval documents uploaded from this conversation.
    pub(crate) async fn add_rag_documents(&self, conversation_id: &str, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let snapshot = {
            let mut state = self.lock();
            let conv = state.conversation_mut(conversation_id)?;
            conv.rag_document_ids.extend(ids.iter().cloned());
            conv.clone()
        };
        match self.variant() {
            StorageVariant::Local => self.save_conversation(&snapshot).await,
            // The backend has no field for them, so they stay in the local database.
            StorageVariant::Backend => {
                if let Err(e) = self.db.add_conversation_documents(conversation_id, &ids).await {
                    self.report_storage_error("save the conversation's documents", &e);
                }
                self.events.emit(ChatEvent::ConversationUpdated {
                    conversation_id: conversation_id.to_string(),
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn list_versions(&self, message_id: &str) -> Result<Vec<MessageVersion>> {
        Ok(self.repo.list_versions(message_id).await?)
    }
}

/// Title derived from a message: its first line, cut to 30 characters.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or("").trim();
    if first_line.chars().count() > TITLE_LEN {
        let cut: String = first_line.chars().take(TITLE_LEN).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}

pub fn fork_title(title: &str) -> String {
    format!("Fork of {}", title)
}

/// Index of the closest user message before `index`.
pub(crate) fn preceding_user_message(messages: &[Message], index: usize) -> Option<usize> {
    messages[..index.min(messages.len())]
        .iter()
        .rposition(|m| m.role == Role::User)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_TITLE;
    use crate::services::store::LocalStore;

    const GREETING: &str = "How can I help you today?";

    fn store_with(db: Database) -> ConversationStore {
        ConversationStore::new(
            Arc::new(LocalStore::new(db.clone())),
            db,
            Some(GREETING.to_string()),
            EventSink::disabled(),
        )
    }

    fn store() -> ConversationStore {
        store_with(Database::new_in_memory().unwrap())
    }

    #[test]
    fn test_truncate_title() {
        assert_eq!(truncate_title("Hello"), "Hello");
        assert_eq!(
            truncate_title("abcdefghijklmnopqrstuvwxyz0123456789"),
            "abcdefghijklmnopqrstuvwxyz0123..."
        );
        assert_eq!(truncate_title("first line\nsecond line"), "first line");
        assert_eq!(truncate_title(&"é".repeat(31)), format!("{}...", "é".repeat(30)));
    }

    #[tokio::test]
    async fn test_append_message_persists_and_returns_it() {
        let db = Database::new_in_memory().unwrap();
        let store = store_with(db.clone());
        let conv = store.create().await.unwrap();

        let appended = store
            .append_message(&conv.id, Message::new(Role::User, "Hello"), &[])
            .await
            .unwrap();
        assert_eq!(appended.content, "Hello");
        assert_eq!(store.get(&conv.id).unwrap().messages.len(), 2);

        let stored = db.list_messages(&conv.id).await.unwrap();
        assert_eq!(stored.last().unwrap().id, appended.id);
        assert!(matches!(
            store
                .append_message("missing", Message::new(Role::User, "x"), &[])
                .await,
            Err(PipelineError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_seeds_greeting_and_selects() {
        let store = store();
        let conv = store.create().await.unwrap();
        assert_eq!(conv.title, DEFAULT_TITLE);
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, Role::System);
        assert_eq!(conv.messages[0].content, GREETING);
        assert_eq!(store.selected_id(), Some(conv.id));
    }

    #[tokio::test]
    async fn test_delete_selected_picks_most_recent() {
        let store = store();
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        let c = store.create().await.unwrap();
        store.rename(&a.id, "Touched last").await.unwrap();
        store.select(&c.id).await.unwrap();

        store.delete(&c.id).await.unwrap();
        assert_eq!(store.selected_id(), Some(a.id.clone()));

        store.delete(&a.id).await.unwrap();
        assert_eq!(store.selected_id(), Some(b.id.clone()));

        store.delete(&b.id).await.unwrap();
        assert_eq!(store.selected_id(), None);
        assert!(matches!(
            store.delete(&b.id).await,
            Err(PipelineError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_rejects_empty() {
        let store = store();
        let conv = store.create().await.unwrap();
        assert!(matches!(
            store.rename(&conv.id, "   ").await,
            Err(PipelineError::EmptyTitle)
        ));
        store.rename(&conv.id, "Trip planning").await.unwrap();
        assert_eq!(store.get(&conv.id).unwrap().title, "Trip planning");
    }

    #[tokio::test]
    async fn test_selection_survives_reload() {
        let db = Database::new_in_memory().unwrap();
        let store = store_with(db.clone());
        let a = store.create().await.unwrap();
        let _b = store.create().await.unwrap();
        store.select(&a.id).await.unwrap();

        let reloaded = store_with(db.clone());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.selected_id(), Some(a.id.clone()));
        assert_eq!(reloaded.list().len(), 2);

        // Unknown saved id falls back to the first conversation
        db.set_setting(SELECTED_KEY, "gone").await.unwrap();
        let reloaded = store_with(db);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.selected_id(), Some(reloaded.list()[0].id.clone()));
    }

    #[tokio::test]
    async fn test_fork_copies_messages_with_new_ids() {
        let store = store();
        let conv = store.create().await.unwrap();
        let user = store
            .append_message(&conv.id, Message::new(Role::User, "Hi"), &[])
            .await
            .unwrap();

        let fork = store.fork(&conv.id).await.unwrap();
        assert_eq!(fork.title, "Fork of New Conversation");
        assert_eq!(fork.messages.len(), 2);
        assert_ne!(fork.messages[1].id, user.id);
        assert_eq!(fork.messages[1].content, "Hi");
        assert_eq!(store.selected_id(), Some(fork.id));
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let store = store();
        let conv = store.create().await.unwrap();
        store
            .append_message(&conv.id, Message::new(Role::User, "Question"), &[])
            .await
            .unwrap();
        let (_, generation) = store.history(&conv.id).unwrap();

        store.rename(&conv.id, "Renamed").await.unwrap();
        let edited = store.get(&conv.id).unwrap().messages[1].id.clone();
        store
            .edit_message(&conv.id, &edited, "Changed", true)
            .await
            .unwrap();

        let result = store
            .apply_reply(&conv.id, generation, Message::new(Role::Assistant, "Late"))
            .await;
        assert!(matches!(result, Err(PipelineError::Superseded)));
        assert_eq!(store.get(&conv.id).unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_sets_title_from_first_user_message() {
        let store = store();
        let conv = store.create().await.unwrap();
        store
            .append_message(&conv.id, Message::new(Role::User, "What is the capital of France, exactly?"), &[])
            .await
            .unwrap();
        let (_, generation) = store.history(&conv.id).unwrap();
        store
            .apply_reply(&conv.id, generation, Message::new(Role::Assistant, "Paris"))
            .await
            .unwrap();

        let conv = store.get(&conv.id).unwrap();
        assert_eq!(conv.title, "What is the capital of France,...");
        assert_eq!(conv.messages.len(), 3);
    }

    #[test]
    fn test_preceding_user_message() {
        let messages = vec![
            Message::new(Role::System, "greeting"),
            Message::new(Role::User, "q1"),
            Message::new(Role::Assistant, "a1"),
        ];
        assert_eq!(preceding_user_message(&messages, 2), Some(1));
        assert_eq!(preceding_user_message(&messages, 1), None);
    }
}

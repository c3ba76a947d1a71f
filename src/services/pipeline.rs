use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::models::{Conversation, Endpoint, Message, MessageVersion, PendingFile, RagSettings, Role};
use crate::providers::{ChatMessage, ChatRequest, ChatResponse, ProviderError, ProviderRouter};
use crate::services::attachments::process_files;
use crate::services::chat::{build_request, collect_stream, messages_to_chat_messages};
use crate::services::conversation::{preceding_user_message, ConversationStore};
use crate::services::database::Database;
use crate::services::endpoints::EndpointRegistry;
use crate::services::events::{ChatEvent, EventSink, Severity};
use crate::services::rag::{context_message, RagClient};
use crate::services::settings::SettingsService;

struct Turn {
    id: u64,
    cancel: CancellationToken,
}

type TurnMap = Mutex<HashMap<String, Turn>>;

fn lock_turns(turns: &TurnMap) -> MutexGuard<'_, HashMap<String, Turn>> {
    turns.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a conversation as generating until dropped.
struct TurnGuard<'a> {
    turns: &'a TurnMap,
    events: &'a EventSink,
    conversation_id: String,
    id: u64,
    cancel: CancellationToken,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut turns = lock_turns(self.turns);
        // A newer turn may have replaced this one.
        if turns.get(&self.conversation_id).map(|t| t.id) == Some(self.id) {
            turns.remove(&self.conversation_id);
            drop(turns);
            self.events.emit(ChatEvent::Loading {
                conversation_id: self.conversation_id.clone(),
                loading: false,
            });
        }
    }
}

/// Sends messages and keeps conversations consistent with the replies.
pub struct MessagePipeline {
    store: Arc<ConversationStore>,
    endpoints: Arc<EndpointRegistry>,
    router: Arc<ProviderRouter>,
    rag: RagClient,
    db: Database,
    events: EventSink,
    turns: TurnMap,
    next_turn: AtomicU64,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<ConversationStore>,
        endpoints: Arc<EndpointRegistry>,
        router: Arc<ProviderRouter>,
        rag: RagClient,
        db: Database,
    ) -> Self {
        let events = store.events().clone();
        Self {
            store,
            endpoints,
            router,
            rag,
            db,
            events,
            turns: Mutex::new(HashMap::new()),
            next_turn: AtomicU64::new(1),
        }
    }

    pub fn is_loading(&self, conversation_id: &str) -> bool {
        lock_turns(&self.turns).contains_key(conversation_id)
    }

    /// Cancel the in-flight turn of a conversation (the selected one by default).
    pub fn stop_generation(&self, conversation_id: Option<&str>) -> bool {
        let Some(id) = conversation_id
            .map(str::to_string)
            .or_else(|| self.store.selected_id())
        else {
            return false;
        };
        match lock_turns(&self.turns).get(&id) {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim a conversation for a turn. With `supersede`, a running turn is cancelled
    /// instead of rejecting the new one.
    fn begin_turn(&self, conversation_id: &str, supersede: bool) -> Result<TurnGuard<'_>> {
        let mut turns = lock_turns(&self.turns);
        if let Some(existing) = turns.get(conversation_id) {
            if !supersede {
                return Err(PipelineError::Busy);
            }
            existing.cancel.cancel();
        }
        let id = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        turns.insert(
            conversation_id.to_string(),
            Turn {
                id,
                cancel: cancel.clone(),
            },
        );
        drop(turns);

        self.events.emit(ChatEvent::Loading {
            conversation_id: conversation_id.to_string(),
            loading: true,
        });
        Ok(TurnGuard {
            turns: &self.turns,
            events: &self.events,
            conversation_id: conversation_id.to_string(),
            id,
            cancel,
        })
    }

    fn require_endpoint(&self) -> Result<Endpoint> {
        self.endpoints.active().ok_or_else(|| {
            tracing::warn!("No active endpoint, message kept without a reply");
            self.events.notice(
                Severity::Warning,
                "No API endpoint selected",
                "Please select an API endpoint first.",
            );
            PipelineError::NoActiveEndpoint
        })
    }

    /// Send a user message in the selected conversation (creating one if needed)
    /// and return the assistant reply.
    pub async fn send_message(&self, content: &str, files: Vec<PendingFile>) -> Result<Message> {
        if content.trim().is_empty() && files.is_empty() {
            return Err(PipelineError::InvalidInput("Message is empty".to_string()));
        }
        let attachments = process_files(&files).map_err(|e| {
            self.events.notice(Severity::Error, "Invalid attachment", e.to_string());
            e
        })?;

        let conversation_id = match self.store.selected_id() {
            Some(id) => id,
            None => self.store.create().await?.id,
        };

        let guard = self.begin_turn(&conversation_id, false).map_err(|e| {
            self.events.notice(
                Severity::Warning,
                "Please wait",
                "A response is still being generated.",
            );
            e
        })?;

        let user = Message::new(Role::User, content).with_files(attachments);
        self.store.append_message(&conversation_id, user, &files).await?;

        let endpoint = self.require_endpoint()?;
        self.run_turn(&conversation_id, &endpoint, &guard.cancel, content, &files)
            .await
    }

    /// Replace a message's content. Editing a user message drops everything after it
    /// and returns the regenerated reply.
    pub async fn edit_message(&self, message_id: &str, content: &str) -> Result<Option<Message>> {
        if content.trim().is_empty() {
            return Err(PipelineError::InvalidInput("Message content cannot be empty".to_string()));
        }
        let (conversation, index) = self
            .store
            .locate(message_id)
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
        let role = conversation.messages[index].role;

        if role != Role::User {
            self.store
                .edit_message(&conversation.id, message_id, content, false)
                .await?;
            return Ok(None);
        }

        let guard = self.begin_turn(&conversation.id, true)?;
        self.store
            .edit_message(&conversation.id, message_id, content, true)
            .await?;

        let endpoint = self.require_endpoint()?;
        let reply = self
            .run_turn(&conversation.id, &endpoint, &guard.cancel, content, &[])
            .await?;
        Ok(Some(reply))
    }

    /// Drop a user message and everything after it, then send its content again.
    pub async fn resend_message(&self, message_id: &str) -> Result<Message> {
        let (conversation, index) = self
            .store
            .locate(message_id)
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
        let original = conversation.messages[index].clone();
        if original.role != Role::User {
            return Err(PipelineError::NotAUserMessage("resent"));
        }

        let guard = self.begin_turn(&conversation.id, true)?;
        self.store.truncate_from(&conversation.id, index).await?;

        let fresh = Message::new(Role::User, original.content.clone()).with_files(original.files);
        self.store.append_message(&conversation.id, fresh, &[]).await?;

        let endpoint = self.require_endpoint()?;
        self.run_turn(&conversation.id, &endpoint, &guard.cancel, &original.content, &[])
            .await
    }

    /// Drop an assistant reply and everything after it, then ask for a new one.
    pub async fn regenerate(&self, message_id: &str) -> Result<Message> {
        let (conversation, index) = self
            .store
            .locate(message_id)
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
        if conversation.messages[index].role != Role::Assistant {
            return Err(PipelineError::InvalidInput(
                "Only assistant replies can be regenerated".to_string(),
            ));
        }
        let user_index = preceding_user_message(&conversation.messages, index)
            .ok_or(PipelineError::NoPrecedingUserMessage)?;
        let query = conversation.messages[user_index].content.clone();

        let guard = self.begin_turn(&conversation.id, true)?;
        self.store.truncate_from(&conversation.id, index).await?;

        let endpoint = self.require_endpoint()?;
        self.run_turn(&conversation.id, &endpoint, &guard.cancel, &query, &[])
            .await
    }

    /// Delete a message. A user message takes the assistant reply after it along.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let (conversation, index) = self
            .store
            .locate(message_id)
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
        let message = &conversation.messages[index];
        if message.is_protected() {
            self.events.notice(
                Severity::Warning,
                "Cannot delete",
                "System messages cannot be deleted.",
            );
            return Err(PipelineError::ProtectedMessage);
        }

        let mut ids = vec![message.id.clone()];
        if message.role == Role::User {
            if let Some(next) = conversation.messages.get(index + 1) {
                if next.role == Role::Assistant {
                    ids.push(next.id.clone());
                }
            }
        }
        self.store.remove_messages(&conversation.id, &ids).await
    }

    /// Start a new conversation from the messages before `message_id`, continue it
    /// with `content` as the user message, and generate a reply there.
    pub async fn fork_from_version(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Conversation> {
        let source = self
            .store
            .get(conversation_id)
            .ok_or_else(|| PipelineError::ConversationNotFound(conversation_id.to_string()))?;
        let index = source
            .position(message_id)
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
        let original = &source.messages[index];
        if original.role != Role::User {
            return Err(PipelineError::NotAUserMessage("forked"));
        }

        let fork = self.store.fork_with(&source, index).await?;
        let guard = self.begin_turn(&fork.id, false)?;
        let user = Message::new(Role::User, content).with_files(original.files.clone());
        self.store.append_message(&fork.id, user, &[]).await?;

        let endpoint = self.require_endpoint()?;
        self.run_turn(&fork.id, &endpoint, &guard.cancel, content, &[])
            .await?;
        self.store
            .get(&fork.id)
            .ok_or(PipelineError::ConversationNotFound(fork.id))
    }

    pub async fn view_message_versions(&self, message_id: &str) -> Result<Vec<MessageVersion>> {
        if self.store.locate(message_id).is_none() {
            return Err(PipelineError::MessageNotFound(message_id.to_string()));
        }
        self.store.list_versions(message_id).await
    }

    /// Put a stored version back through the edit path.
    pub async fn restore_message_version(
        &self,
        message_id: &str,
        version_id: &str,
    ) -> Result<Option<Message>> {
        let versions = self.view_message_versions(message_id).await?;
        let version = versions
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or_else(|| PipelineError::VersionNotFound(version_id.to_string()))?;
        self.edit_message(message_id, &version.content).await
    }

    /// Ask the endpoint for a reply to the conversation as it stands.
    async fn run_turn(
        &self,
        conversation_id: &str,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
        query: &str,
        files: &[PendingFile],
    ) -> Result<Message> {
        let context = match endpoint.active_rag() {
            Some(rag) => Some(
                self.retrieve_context(conversation_id, rag, query, files)
                    .await?,
            ),
            None => None,
        };

        let (history, generation) = self.store.history(conversation_id)?;
        let mut chat_messages: Vec<ChatMessage> = context.into_iter().collect();
        chat_messages.extend(messages_to_chat_messages(&history));

        let settings = SettingsService::load(&self.db).await;
        let request = build_request(endpoint, chat_messages, &settings);
        tracing::debug!(
            "Requesting completion for {} from {} ({})",
            conversation_id,
            endpoint.name,
            endpoint.model
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.complete(conversation_id, endpoint, request, settings.stream_responses) => Some(result),
        };

        match outcome {
            None => {
                tracing::info!("Generation stopped for conversation {}", conversation_id);
                self.events.emit(ChatEvent::ReplyDiscarded {
                    conversation_id: conversation_id.to_string(),
                });
                Err(PipelineError::Cancelled)
            }
            Some(Ok(response)) => {
                let reply = Message::new(Role::Assistant, response.content);
                self.store.apply_reply(conversation_id, generation, reply).await
            }
            Some(Err(e)) => {
                tracing::error!("Completion failed for conversation {}: {}", conversation_id, e);
                self.events.notice(Severity::Error, "Error", e.to_string());
                let note = Message::new(Role::Assistant, format!("Error: {}", e));
                if let Err(discarded) = self.store.apply_reply(conversation_id, generation, note).await {
                    tracing::debug!("Error reply not recorded: {}", discarded);
                }
                Err(e.into())
            }
        }
    }

    async fn complete(
        &self,
        conversation_id: &str,
        endpoint: &Endpoint,
        request: ChatRequest,
        stream: bool,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        if !stream {
            return self.router.send_message(&endpoint.kind, request).await;
        }
        let events = self.events.clone();
        let conversation_id = conversation_id.to_string();
        collect_stream(&self.router, endpoint, request, move |delta| {
            events.emit(ChatEvent::Token {
                conversation_id: conversation_id.clone(),
                delta: delta.to_string(),
            })
        })
        .await
    }

    /// Upload new files to the retrieval service, then fetch context for `query`
    /// from this conversation's documents only.
    async fn retrieve_context(
        &self,
        conversation_id: &str,
        rag: &RagSettings,
        query: &str,
        files: &[PendingFile],
    ) -> Result<ChatMessage> {
        let mut uploaded = Vec::new();
        for file in files {
            match self.rag.upload_document(rag, file).await {
                Ok(id) => uploaded.push(id),
                Err(e) => {
                    tracing::warn!("Failed to upload {} for retrieval: {:#}", file.name, e);
                    self.events.notice(
                        Severity::Warning,
                        "Upload failed",
                        format!("{} could not be indexed: {:#}", file.name, e),
                    );
                }
            }
        }
        self.store.add_rag_documents(conversation_id, uploaded).await?;

        let document_ids = self
            .store
            .get(conversation_id)
            .map(|c| c.rag_document_ids)
            .unwrap_or_default();
        let retrieved = if document_ids.is_empty() {
            Ok(Vec::new())
        } else {
            self.rag.retrieve(rag, query, &document_ids).await
        };
        if let Err(e) = &retrieved {
            tracing::warn!("Context retrieval failed: {:#}", e);
        }
        Ok(context_message(&retrieved))
    }
}

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    AttachmentSource, Conversation, FileAttachment, Message, MessageVersion, PendingFile, Role,
};
use crate::services::attachments::guess_mime_type;
use crate::services::store::{ConversationRepository, StorageVariant};

/// Repository backed by the remote chat REST API.
pub struct BackendStore {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for BackendStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStore")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .finish()
    }
}

// --- Wire types ---

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Plain(Vec<T>),
    Page { results: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Plain(items) => items,
            Listing::Page { results } => results,
        }
    }
}

#[derive(Deserialize)]
struct BackendConversation {
    id: Value,
    title: String,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    messages: Vec<BackendMessage>,
}

#[derive(Deserialize)]
struct BackendMessage {
    id: Value,
    role: String,
    content: String,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    files: Vec<BackendFile>,
}

#[derive(Deserialize)]
struct BackendFile {
    file: Option<String>,
    filename: Option<String>,
}

#[derive(Deserialize)]
struct BackendVersion {
    id: Value,
    content: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    files: Value,
}

#[derive(Serialize)]
struct NewConversationBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct NewMessageBody<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct PatchMessageBody<'a> {
    content: &'a str,
}

/// Server ids may be integers or strings.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl BackendFile {
    fn into_attachment(self) -> FileAttachment {
        let name = self
            .filename
            .or_else(|| {
                self.file
                    .as_deref()
                    .and_then(|f| f.rsplit('/').next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "file".to_string());
        FileAttachment {
            mime_type: guess_mime_type(&name).to_string(),
            name,
            source: match self.file {
                Some(url) => AttachmentSource::Remote(url),
                None => AttachmentSource::Placeholder,
            },
        }
    }
}

impl BackendMessage {
    fn into_message(self) -> Result<Message> {
        let role = Role::from_str(&self.role)
            .with_context(|| format!("Unknown message role from backend: {}", self.role))?;
        Ok(Message {
            id: id_string(&self.id),
            role,
            content: self.content,
            files: self.files.into_iter().map(BackendFile::into_attachment).collect(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

impl BackendConversation {
    fn into_conversation(self) -> Result<Conversation> {
        let now = Utc::now();
        let messages = self
            .messages
            .into_iter()
            .map(BackendMessage::into_message)
            .collect::<Result<Vec<_>>>()?;
        Ok(Conversation {
            id: id_string(&self.id),
            title: self.title,
            messages,
            rag_document_ids: Vec::new(),
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
        })
    }
}

impl BackendStore {
    pub fn new(backend_url: &str, token: impl Into<String>, timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        });
        Self {
            client,
            base_url: format!("{}/api/chat", backend_url.trim_end_matches('/')),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", format!("Token {}", self.token))
    }

    async fn check_status(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("{} failed: HTTP {}: {}", what, status.as_u16(), body.trim());
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let response = self
            .with_auth(req)
            .send()
            .await
            .with_context(|| format!("{} failed", what))?;
        let response = Self::check_status(response, what).await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("{}: unexpected response body", what))
    }

    /// Send a request whose response body is not needed.
    async fn send_unit(&self, req: RequestBuilder, what: &str) -> Result<()> {
        let response = self
            .with_auth(req)
            .send()
            .await
            .with_context(|| format!("{} failed", what))?;
        Self::check_status(response, what).await?;
        Ok(())
    }

    /// DELETE where an already-missing resource counts as deleted.
    async fn delete(&self, path: &str, what: &str) -> Result<()> {
        let response = self
            .with_auth(self.client.delete(self.url(path)))
            .send()
            .await
            .with_context(|| format!("{} failed", what))?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("{}: already gone", what);
            return Ok(());
        }
        Self::check_status(response, what).await?;
        Ok(())
    }

    async fn upload_files(&self, message_id: &str, files: &[PendingFile]) -> Result<Vec<FileAttachment>> {
        let mut form = multipart::Form::new().text("message_id", message_id.to_string());
        for file in files {
            let part = multipart::Part::bytes(file.data.to_vec())
                .file_name(file.name.clone())
                .mime_str(&file.mime_type)
                .with_context(|| format!("Invalid mime type for {}", file.name))?;
            form = form.part("files", part);
        }

        let response: UploadResponse = self
            .send_json(
                self.client.post(self.url("files/upload/")).multipart(form),
                "File upload",
            )
            .await?;

        let uploaded = match response.files {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value::<BackendFile>(item).ok())
                .map(BackendFile::into_attachment)
                .collect(),
            _ => Vec::new(),
        };
        Ok(uploaded)
    }
}

#[async_trait]
impl ConversationRepository for BackendStore {
    fn variant(&self) -> StorageVariant {
        StorageVariant::Backend
    }

    async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        let listing: Listing<BackendConversation> = self
            .send_json(self.client.get(self.url("conversations/")), "Loading conversations")
            .await?;
        let mut conversations = listing
            .into_vec()
            .into_iter()
            .map(BackendConversation::into_conversation)
            .collect::<Result<Vec<_>>>()?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<Conversation> {
        let created: BackendConversation = self
            .send_json(
                self.client
                    .post(self.url("conversations/"))
                    .json(&NewConversationBody {
                        title: &conversation.title,
                    }),
                "Creating conversation",
            )
            .await?;
        let mut stored = created.into_conversation()?;

        for message in &conversation.messages {
            let saved = self.append_message(&stored.id, message, &[]).await?;
            stored.messages.push(saved);
        }
        stored.rag_document_ids = conversation.rag_document_ids.clone();
        Ok(stored)
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        let path = format!("conversations/{}/rename/", conversation.id);
        self.send_unit(
            self.client.post(self.url(&path)).json(&NewConversationBody {
                title: &conversation.title,
            }),
            "Renaming conversation",
        )
        .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.delete(&format!("conversations/{}/", id), "Deleting conversation")
            .await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: &Message,
        files: &[PendingFile],
    ) -> Result<Message> {
        let path = format!("conversations/{}/add_message/", conversation_id);
        let created: BackendMessage = self
            .send_json(
                self.client.post(self.url(&path)).json(&NewMessageBody {
                    role: message.role.as_str(),
                    content: &message.content,
                }),
                "Saving message",
            )
            .await?;
        let mut stored = created.into_message()?;
        stored.files = message.files.clone();

        if !files.is_empty() {
            let uploaded = self.upload_files(&stored.id, files).await?;
            if !uploaded.is_empty() {
                stored.files = uploaded;
            }
        }
        Ok(stored)
    }

    async fn update_message(
        &self,
        _conversation_id: &str,
        message: &Message,
        _previous_content: &str,
    ) -> Result<()> {
        // The server records the displaced content as a version itself.
        let path = format!("messages/{}/", message.id);
        self.send_unit(
            self.client.patch(self.url(&path)).json(&PatchMessageBody {
                content: &message.content,
            }),
            "Updating message",
        )
        .await
    }

    async fn delete_messages(&self, _conversation_id: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            self.delete(&format!("messages/{}/", id), "Deleting message")
                .await?;
        }
        Ok(())
    }

    async fn list_versions(&self, message_id: &str) -> Result<Vec<MessageVersion>> {
        let path = format!("messages/{}/versions/", message_id);
        let listing: Listing<BackendVersion> = self
            .send_json(self.client.get(self.url(&path)), "Loading message versions")
            .await?;
        let mut versions: Vec<MessageVersion> = listing
            .into_vec()
            .into_iter()
            .map(|v| MessageVersion {
                id: id_string(&v.id),
                message_id: message_id.to_string(),
                content: v.content,
                created_at: v.created_at.unwrap_or_else(Utc::now),
            })
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }
}

use thiserror::Error;

use crate::providers::types::ProviderError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No API endpoint selected")]
    NoActiveEndpoint,

    #[error("No conversation selected")]
    NoConversation,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("System messages cannot be deleted")]
    ProtectedMessage,

    #[error("Only user messages can be {0}")]
    NotAUserMessage(&'static str),

    #[error("No preceding user message found")]
    NoPrecedingUserMessage,

    #[error("A response is already being generated for this conversation")]
    Busy,

    #[error("Generation stopped")]
    Cancelled,

    #[error("Response discarded: the conversation changed while it was generated")]
    Superseded,

    #[error("Invalid attachment {name}: {reason}")]
    InvalidAttachment { name: String, reason: String },

    #[error("Conversation title cannot be empty")]
    EmptyTitle,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn invalid_attachment(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAttachment {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

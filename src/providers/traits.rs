use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::types::{
    ChatRequest, ChatResponse, ImageRequest, ModelInfo, ProviderError, SpeechRequest, StreamEvent,
};
use crate::models::ProviderKind;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn list_models(&self, api_key: &str, base_url: &str)
        -> Result<Vec<ModelInfo>, ProviderError>;

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;

    /// Returns the URLs of the generated images.
    async fn generate_image(&self, _request: ImageRequest) -> Result<Vec<String>, ProviderError> {
        Err(ProviderError::Unsupported("image generation"))
    }

    async fn synthesize_speech(&self, _request: SpeechRequest) -> Result<Bytes, ProviderError> {
        Err(ProviderError::Unsupported("speech synthesis"))
    }
}

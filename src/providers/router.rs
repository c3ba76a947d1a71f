use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::offline::OfflineProvider;
use super::openai::OpenAiProvider;
use super::traits::CompletionProvider;
use super::types::{
    ChatRequest, ChatResponse, ImageRequest, ModelInfo, ProviderError, SpeechRequest, StreamEvent,
};
use crate::models::ProviderKind;

pub struct ProviderRouter {
    providers: HashMap<ProviderKind, Arc<dyn CompletionProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Router with the HTTP client and the offline stub registered.
    pub fn with_defaults(timeout: Option<Duration>) -> Self {
        let mut router = Self::new();
        router.register(Arc::new(OpenAiProvider::new(timeout)));
        router.register(Arc::new(OfflineProvider::new()));
        router
    }

    pub fn register(&mut self, provider: Arc<dyn CompletionProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    fn provider(&self, kind: &ProviderKind) -> Result<&Arc<dyn CompletionProvider>, ProviderError> {
        self.providers.get(kind).ok_or_else(|| {
            ProviderError::RequestFailed(format!("Unknown provider: {:?}", kind))
        })
    }

    pub async fn list_models(
        &self,
        kind: &ProviderKind,
        api_key: &str,
        base_url: &str,
    ) -> Result<Vec<ModelInfo>, ProviderError> {
        self.provider(kind)?.list_models(api_key, base_url).await
    }

    pub async fn send_message(
        &self,
        kind: &ProviderKind,
        request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        self.provider(kind)?.send_message(request).await
    }

    pub async fn stream_message(
        &self,
        kind: &ProviderKind,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.provider(kind)?.stream_message(request, tx).await
    }

    pub async fn generate_image(
        &self,
        kind: &ProviderKind,
        request: ImageRequest,
    ) -> Result<Vec<String>, ProviderError> {
        self.provider(kind)?.generate_image(request).await
    }

    pub async fn synthesize_speech(
        &self,
        kind: &ProviderKind,
        request: SpeechRequest,
    ) -> Result<Bytes, ProviderError> {
        self.provider(kind)?.synthesize_speech(request).await
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

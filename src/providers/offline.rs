use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::CompletionProvider;
use super::types::{ChatRequest, ChatResponse, ModelInfo, ProviderError, StreamEvent};
use crate::models::{ProviderKind, Role};

pub const OFFLINE_MODEL: &str = "offline-stub";

/// Answers every request locally with a canned reply; no network traffic.
pub struct OfflineProvider;

impl OfflineProvider {
    pub fn new() -> Self {
        Self
    }

    fn excerpt(text: &str) -> String {
        let head: String = text.chars().take(20).collect();
        if text.chars().count() > 20 {
            format!("{}...", head)
        } else {
            head
        }
    }

    /// Pick a reply template from the last user message. Deterministic for a given input.
    pub fn reply_for(request: &ChatRequest) -> String {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let excerpt = Self::excerpt(prompt);
        let model = &request.model;

        let variant = prompt.chars().count() % 3;
        match variant {
            0 => format!(
                "You asked about \"{}\". This reply comes from the offline endpoint ({}); no model was contacted.",
                excerpt, model
            ),
            1 => format!(
                "Message received. Connect an OpenAI-compatible endpoint to get real answers; currently using {}.",
                model
            ),
            _ => format!(
                "Offline mode: \"{}\" would be sent to a language model through {} once one is configured.",
                excerpt, model
            ),
        }
    }
}

impl Default for OfflineProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for OfflineProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Offline
    }

    async fn list_models(
        &self,
        _api_key: &str,
        _base_url: &str,
    ) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![ModelInfo {
            id: OFFLINE_MODEL.to_string(),
            endpoints: Vec::new(),
        }])
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            content: Self::reply_for(&request),
            model: request.model,
            tokens_in: None,
            tokens_out: None,
        })
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let reply = Self::reply_for(&request);
        for word in reply.split_inclusive(' ') {
            if tx.send(StreamEvent::Token(word.to_string())).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx
            .send(StreamEvent::Done {
                tokens_in: None,
                tokens_out: None,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ChatMessage;

    fn request(prompt: &str) -> ChatRequest {
        ChatRequest {
            api_key: String::new(),
            base_url: String::new(),
            model: "stub".to_string(),
            messages: vec![
                ChatMessage::system("How can I help you today?"),
                ChatMessage {
                    role: Role::User,
                    content: prompt.to_string(),
                },
            ],
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_reply_is_non_empty_and_stable() {
        let provider = OfflineProvider::new();
        let first = provider.send_message(request("Hello")).await.unwrap();
        let second = provider.send_message(request("Hello")).await.unwrap();
        assert!(!first.content.is_empty());
        assert_eq!(first.content, second.content);
    }

    #[tokio::test]
    async fn test_stream_reassembles_to_full_reply() {
        let provider = OfflineProvider::new();
        let (tx, mut rx) = mpsc::channel(64);
        provider.stream_message(request("Tell me a story"), tx).await.unwrap();

        let mut text = String::new();
        let mut done = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(t) => text.push_str(&t),
                StreamEvent::Done { .. } => done = true,
                StreamEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(done);
        assert_eq!(text, OfflineProvider::reply_for(&request("Tell me a story")));
    }

    #[test]
    fn test_excerpt_truncates_long_prompts() {
        assert_eq!(OfflineProvider::excerpt("short"), "short");
        assert_eq!(
            OfflineProvider::excerpt("a prompt that is definitely longer"),
            "a prompt that is def..."
        );
    }
}

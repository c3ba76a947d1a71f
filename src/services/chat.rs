use tokio::sync::mpsc;

use crate::models::{Endpoint, Message};
use crate::providers::{ChatMessage, ChatRequest, ChatResponse, ProviderError, ProviderRouter, StreamEvent};
use crate::services::settings::AppSettings;

/// Build a `ChatRequest` for the endpoint from the conversation so far.
pub fn build_request(
    endpoint: &Endpoint,
    chat_messages: Vec<ChatMessage>,
    settings: &AppSettings,
) -> ChatRequest {
    let temperature = if (settings.temperature - 1.0).abs() < f32::EPSILON {
        None
    } else {
        Some(settings.temperature)
    };

    let mut messages = Vec::with_capacity(chat_messages.len() + 1);
    if let Some(prompt) = settings
        .default_system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(chat_messages);

    ChatRequest {
        api_key: endpoint.api_key.clone(),
        base_url: endpoint.base_url.clone(),
        model: endpoint.model.clone(),
        messages,
        temperature,
        max_tokens: None,
    }
}

/// Convert `Message` list to `ChatMessage` list for the provider API.
pub fn messages_to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect()
}

/// Run a streaming request to completion, calling `on_token` for each delta.
pub async fn collect_stream<F>(
    router: &ProviderRouter,
    endpoint: &Endpoint,
    request: ChatRequest,
    mut on_token: F,
) -> Result<ChatResponse, ProviderError>
where
    F: FnMut(&str) + Send,
{
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
    let model = request.model.clone();

    let producer = router.stream_message(&endpoint.kind, request, tx);
    let consumer = async move {
        let mut accumulated = String::new();
        loop {
            match rx.recv().await {
                Some(StreamEvent::Token(token)) => {
                    accumulated.push_str(&token);
                    on_token(&token);
                }
                Some(StreamEvent::Done {
                    tokens_in,
                    tokens_out,
                }) => {
                    return Ok(ChatResponse {
                        content: accumulated,
                        model,
                        tokens_in,
                        tokens_out,
                    });
                }
                Some(StreamEvent::Error(error)) => {
                    return Err(ProviderError::RequestFailed(error));
                }
                None => {
                    if accumulated.is_empty() {
                        return Err(ProviderError::InvalidResponse(
                            "Stream ended unexpectedly".to_string(),
                        ));
                    }
                    return Ok(ChatResponse {
                        content: accumulated,
                        model,
                        tokens_in: None,
                        tokens_out: None,
                    });
                }
            }
        }
    };

    let (produced, collected) = tokio::join!(producer, consumer);
    produced?;
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProviderKind, Role};
    use chrono::Utc;

    fn endpoint(kind: ProviderKind) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: "ep".to_string(),
            name: "Test".to_string(),
            kind,
            base_url: "https://api.example.com/v1".to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-4o".to_string(),
            is_active: true,
            rag: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_build_request_defaults() {
        let messages = vec![Message::new(Role::User, "Hello")];
        let req = build_request(
            &endpoint(ProviderKind::OpenAi),
            messages_to_chat_messages(&messages),
            &AppSettings::default(),
        );
        assert_eq!(req.temperature, None);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.model, "gpt-4o");
    }

    #[test]
    fn test_build_request_with_system_prompt() {
        let settings = AppSettings {
            temperature: 0.5,
            default_system_prompt: Some("Answer in French.".to_string()),
            ..AppSettings::default()
        };
        let req = build_request(
            &endpoint(ProviderKind::OpenAi),
            vec![ChatMessage {
                role: Role::User,
                content: "Hi".to_string(),
            }],
            &settings,
        );
        assert_eq!(req.temperature, Some(0.5));
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].content, "Hi");
    }

    #[tokio::test]
    async fn test_collect_stream_from_offline_provider() {
        let router = ProviderRouter::with_defaults(None);
        let ep = endpoint(ProviderKind::Offline);
        let req = build_request(
            &ep,
            vec![ChatMessage {
                role: Role::User,
                content: "Tell me something".to_string(),
            }],
            &AppSettings::default(),
        );

        let mut deltas = Vec::new();
        let response = collect_stream(&router, &ep, req, |t| deltas.push(t.to_string()))
            .await
            .unwrap();
        assert!(!response.content.is_empty());
        assert_eq!(deltas.concat(), response.content);
    }
}

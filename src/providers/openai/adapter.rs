use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::mpsc;

use super::models::*;
use super::stream::parse_sse_stream;
use crate::models::ProviderKind;
use crate::providers::traits::CompletionProvider;
use crate::providers::types::{
    ChatMessage, ChatRequest, ChatResponse, ImageRequest, ModelInfo, ProviderError, SpeechRequest,
    StreamEvent,
};

/// Client for any server speaking the OpenAI REST dialect.
pub struct OpenAiProvider {
    client: Client,
}

impl OpenAiProvider {
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        });
        Self { client }
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    fn build_messages(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|msg| OpenAiMessage {
                role: msg.role.as_str().to_string(),
                content: Some(msg.content.clone()),
            })
            .collect()
    }

    fn build_chat_body(request: &ChatRequest, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: Self::build_messages(&request.messages),
            stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }

    fn with_auth(req: RequestBuilder, api_key: &str) -> RequestBuilder {
        if api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", api_key))
        }
    }

    fn parse_error_message(status: StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    /// Map non-success statuses onto `ProviderError`.
    async fn check_status(response: Response) -> Result<Response, ProviderError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(response)
    }

    async fn post_json<T: serde::Serialize>(
        &self,
        url: &str,
        api_key: &str,
        body: &T,
    ) -> Result<Response, ProviderError> {
        let req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(body);

        let response = Self::with_auth(req, api_key)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        Self::check_status(response).await
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn list_models(
        &self,
        api_key: &str,
        base_url: &str,
    ) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = Self::url(base_url, "models");

        let response = Self::with_auth(self.client.get(&url), api_key)
            .send()
            .await
            .map_err(|e| {
                ProviderError::NetworkError(format!("Failed to connect to {}: {}", base_url, e))
            })?;
        let response = Self::check_status(response).await?;

        let model_list: OpenAiModelList = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;

        Ok(model_list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                endpoints: m.endpoint.map(ModelEndpoints::into_vec).unwrap_or_default(),
            })
            .collect())
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = Self::url(&request.base_url, "chat/completions");
        let body = Self::build_chat_body(&request, false);

        let response = self.post_json(&url, &request.api_key, &body).await?;

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = openai_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        let (tokens_in, tokens_out) = openai_response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));

        Ok(ChatResponse {
            content,
            model: openai_response.model.unwrap_or(request.model),
            tokens_in,
            tokens_out,
        })
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let url = Self::url(&request.base_url, "chat/completions");
        let body = Self::build_chat_body(&request, true);

        let response = self.post_json(&url, &request.api_key, &body).await?;
        parse_sse_stream(response, tx).await;

        Ok(())
    }

    async fn generate_image(&self, request: ImageRequest) -> Result<Vec<String>, ProviderError> {
        let url = Self::url(&request.base_url, "images/generations");
        let body = OpenAiImageRequest {
            model: request.model,
            prompt: request.prompt,
            n: 1,
            size: request.size,
            quality: "standard".to_string(),
            response_format: "url".to_string(),
        };

        let response = self.post_json(&url, &request.api_key, &body).await?;
        let images: OpenAiImageResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(images.data.into_iter().filter_map(|img| img.url).collect())
    }

    async fn synthesize_speech(&self, request: SpeechRequest) -> Result<Bytes, ProviderError> {
        let url = Self::url(&request.base_url, "audio/speech");
        let body = OpenAiSpeechRequest {
            model: request.model,
            input: request.input,
            voice: request.voice,
        };

        let response = self.post_json(&url, &request.api_key, &body).await?;
        response
            .bytes()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))
    }
}

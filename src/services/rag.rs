use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{multipart, Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{PendingFile, RagSettings};
use crate::providers::ChatMessage;

pub const NO_CONTEXT_NOTE: &str = "No relevant context found. Answering based on general knowledge.";
pub const RETRIEVAL_FAILED_NOTE: &str =
    "Context retrieval failed. Answering based on general knowledge.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub distance: Option<f64>,
}

#[derive(Serialize)]
struct RetrieveBody<'a> {
    query: &'a str,
    document_ids: &'a [String],
    top_k: u32,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    chunks: Vec<RetrievedChunk>,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: Value,
}

/// Client for the document retrieval service attached to an endpoint.
pub struct RagClient {
    client: Client,
}

impl RagClient {
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

    fn url(settings: &RagSettings, path: &str) -> String {
        format!("{}/{}", settings.base_url.trim_end_matches('/'), path)
    }

    fn with_auth(req: RequestBuilder, settings: &RagSettings) -> RequestBuilder {
        match settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    /// Upload a file for indexing. Returns the service's document id.
    pub async fn upload_document(&self, settings: &RagSettings, file: &PendingFile) -> Result<String> {
        let part = multipart::Part::bytes(file.data.to_vec())
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)
            .with_context(|| format!("Invalid mime type for {}", file.name))?;
        let form = multipart::Form::new().part("file", part);

        let response = Self::with_auth(
            self.client
                .post(Self::url(settings, "documents"))
                .multipart(form),
            settings,
        )
        .send()
        .await
        .context("Document upload failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Document upload failed: HTTP {}: {}", status.as_u16(), body.trim());
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .context("Document upload: unexpected response body")?;
        let id = match uploaded.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        tracing::debug!("Uploaded {} as document {}", file.name, id);
        Ok(id)
    }

    /// Chunks relevant to `query`, restricted to `document_ids`.
    pub async fn retrieve(
        &self,
        settings: &RagSettings,
        query: &str,
        document_ids: &[String],
    ) -> Result<Vec<RetrievedChunk>> {
        let response = Self::with_auth(
            self.client
                .post(Self::url(settings, "retrieve"))
                .json(&RetrieveBody {
                    query,
                    document_ids,
                    top_k: settings.top_k,
                }),
            settings,
        )
        .send()
        .await
        .context("Context retrieval failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Context retrieval failed: HTTP {}: {}", status.as_u16(), body.trim());
        }

        let parsed: RetrieveResponse = response
            .json()
            .await
            .context("Context retrieval: unexpected response body")?;
        Ok(parsed.chunks)
    }
}

/// System message describing the retrieval outcome.
pub fn context_message(retrieved: &Result<Vec<RetrievedChunk>>) -> ChatMessage {
    match retrieved {
        Ok(chunks) if chunks.is_empty() => ChatMessage::system(NO_CONTEXT_NOTE),
        Ok(chunks) => ChatMessage::system(context_prompt(chunks)),
        Err(_) => ChatMessage::system(RETRIEVAL_FAILED_NOTE),
    }
}

fn context_prompt(chunks: &[RetrievedChunk]) -> String {
    let context = chunks
        .iter()
        .map(|chunk| {
            format!(
                "[Source: {}, Distance: {:.4}]\n{}",
                chunk.source.as_deref().unwrap_or("Unknown"),
                chunk.distance.unwrap_or(0.0),
                chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Use the following relevant context to answer the user's question. \
         This context is derived from documents provided by the user:\n\n\
         Context:\n{}\n\n\
         Answer the question based on the context above. If the context doesn't contain \
         sufficient information, use your general knowledge but mention this fact.",
        context
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_context_message_variants() {
        assert_eq!(context_message(&Ok(Vec::new())).content, NO_CONTEXT_NOTE);
        assert_eq!(
            context_message(&Err(anyhow!("connection refused"))).content,
            RETRIEVAL_FAILED_NOTE
        );

        let chunks = vec![RetrievedChunk {
            text: "The sky is blue.".to_string(),
            source: Some("facts.txt".to_string()),
            distance: Some(0.25),
        }];
        let msg = context_message(&Ok(chunks));
        assert!(msg.content.contains("[Source: facts.txt, Distance: 0.2500]\nThe sky is blue."));
        assert!(msg.content.starts_with("Use the following relevant context"));
    }
}

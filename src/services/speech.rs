use std::sync::Arc;

use bytes::Bytes;

use crate::error::{PipelineError, Result};
use crate::providers::types::SpeechRequest;
use crate::providers::ProviderRouter;
use crate::services::database::Database;
use crate::services::endpoints::EndpointRegistry;
use crate::services::settings::SettingsService;

/// Text-to-speech through the active endpoint.
pub struct SpeechService {
    endpoints: Arc<EndpointRegistry>,
    router: Arc<ProviderRouter>,
    db: Database,
}

impl SpeechService {
    pub fn new(endpoints: Arc<EndpointRegistry>, router: Arc<ProviderRouter>, db: Database) -> Self {
        Self {
            endpoints,
            router,
            db,
        }
    }

    /// Returns the encoded audio. `voice` falls back to the configured one.
    pub async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Bytes> {
        if text.trim().is_empty() {
            return Err(PipelineError::InvalidInput("Nothing to speak".to_string()));
        }
        let endpoint = self
            .endpoints
            .active()
            .ok_or(PipelineError::NoActiveEndpoint)?;
        let settings = SettingsService::load(&self.db).await;

        let request = SpeechRequest {
            api_key: endpoint.api_key.clone(),
            base_url: endpoint.base_url.clone(),
            model: settings.tts_model,
            input: text.to_string(),
            voice: voice
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .unwrap_or(settings.tts_voice),
        };
        let audio = self.router.synthesize_speech(&endpoint.kind, request).await?;
        tracing::debug!("Synthesized {} bytes of audio", audio.len());
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_text_and_endpoint() {
        let db = Database::new_in_memory().unwrap();
        let router = Arc::new(ProviderRouter::with_defaults(None));
        let endpoints = Arc::new(EndpointRegistry::new(db.clone(), router.clone()));
        let speech = SpeechService::new(endpoints, router, db);

        assert!(matches!(
            speech.synthesize("", None).await,
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            speech.synthesize("Hello", None).await,
            Err(PipelineError::NoActiveEndpoint)
        ));
    }
}

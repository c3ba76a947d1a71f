use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{AppConfig, StorageConfig};
use crate::providers::ProviderRouter;
use crate::services::backend::BackendStore;
use crate::services::conversation::ConversationStore;
use crate::services::database::Database;
use crate::services::endpoints::EndpointRegistry;
use crate::services::events::EventSink;
use crate::services::images::ImageGenerator;
use crate::services::pipeline::MessagePipeline;
use crate::services::prompts::PromptLibrary;
use crate::services::rag::RagClient;
use crate::services::settings::{AppSettings, SettingsService};
use crate::services::speech::SpeechService;
use crate::services::store::{ConversationRepository, LocalStore};

/// Everything a front end needs, wired together.
pub struct ChatSession {
    pub config: AppConfig,
    pub db: Database,
    pub router: Arc<ProviderRouter>,
    pub endpoints: Arc<EndpointRegistry>,
    pub conversations: Arc<ConversationStore>,
    pub pipeline: MessagePipeline,
    pub prompts: PromptLibrary,
    pub images: ImageGenerator,
    pub speech: SpeechService,
}

impl ChatSession {
    /// Open the local database and the configured conversation repository.
    pub async fn open(config: AppConfig, events: EventSink) -> Result<Self> {
        let db = Database::open(&config.db_path())?;
        let timeout = config.request_timeout_secs.map(Duration::from_secs);
        let router = Arc::new(ProviderRouter::with_defaults(timeout));
        let repo: Arc<dyn ConversationRepository> = match &config.storage {
            StorageConfig::Local => Arc::new(LocalStore::new(db.clone())),
            StorageConfig::Backend { url, token } => {
                Arc::new(BackendStore::new(url, token.clone(), timeout))
            }
        };
        Self::open_with(config, db, router, repo, events).await
    }

    pub async fn open_with(
        config: AppConfig,
        db: Database,
        router: Arc<ProviderRouter>,
        repo: Arc<dyn ConversationRepository>,
        events: EventSink,
    ) -> Result<Self> {
        let timeout = config.request_timeout_secs.map(Duration::from_secs);
        let endpoints = Arc::new(EndpointRegistry::new(db.clone(), router.clone()));
        endpoints.load().await?;

        let conversations = Arc::new(ConversationStore::new(
            repo,
            db.clone(),
            config.greeting().map(str::to_string),
            events,
        ));
        conversations
            .load()
            .await
            .context("Failed to load conversations")?;

        let pipeline = MessagePipeline::new(
            conversations.clone(),
            endpoints.clone(),
            router.clone(),
            RagClient::new(timeout),
            db.clone(),
        );

        Ok(Self {
            prompts: PromptLibrary::new(db.clone()),
            images: ImageGenerator::new(endpoints.clone(), router.clone()),
            speech: SpeechService::new(endpoints.clone(), router.clone(), db.clone()),
            config,
            db,
            router,
            endpoints,
            conversations,
            pipeline,
        })
    }

    pub async fn settings(&self) -> AppSettings {
        SettingsService::load(&self.db).await
    }

    pub async fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        SettingsService::save(&self.db, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_local_session_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..AppConfig::default()
        };

        let session = ChatSession::open(config.clone(), EventSink::disabled())
            .await
            .unwrap();
        let conv = session.conversations.create().await.unwrap();
        assert_eq!(conv.messages.len(), 1);
        drop(session);

        let reopened = ChatSession::open(config, EventSink::disabled()).await.unwrap();
        assert_eq!(reopened.conversations.selected_id(), Some(conv.id));
    }
}

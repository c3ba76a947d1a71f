use anyhow::{bail, Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::models::SavedPrompt;
use crate::services::database::Database;

/// Reusable prompts, independent of conversations.
pub struct PromptLibrary {
    db: Database,
}

impl PromptLibrary {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, name: &str, content: &str) -> Result<SavedPrompt> {
        if name.trim().is_empty() {
            bail!("Prompt name is required");
        }
        if content.trim().is_empty() {
            bail!("Prompt content is required");
        }
        let prompt = SavedPrompt {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.db
            .insert_prompt(&prompt)
            .await
            .context("Failed to save prompt")?;
        tracing::info!("Saved prompt {}", prompt.name);
        Ok(prompt)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.db
            .delete_prompt(id)
            .await
            .context("Failed to delete prompt")
    }

    /// Saved prompts, newest first.
    pub async fn list(&self) -> Result<Vec<SavedPrompt>> {
        self.db.list_prompts().await.context("Failed to load prompts")
    }
}

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::config::FALLBACK_MODELS;
use crate::models::{Endpoint, EndpointUpdate, NewEndpoint, ProviderKind};
use crate::providers::ProviderRouter;
use crate::services::database::Database;

const IMAGE_ROUTE: &str = "/v1/images/generations";

/// The configured endpoints and which one is active.
pub struct EndpointRegistry {
    db: Database,
    router: Arc<ProviderRouter>,
    endpoints: RwLock<Vec<Endpoint>>,
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("Base URL is required");
    }
    let parsed = Url::parse(trimmed).with_context(|| format!("Invalid base URL: {}", trimmed))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("Base URL must use http or https: {}", trimmed);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn validate(name: &str, kind: ProviderKind, api_key: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Endpoint name is required");
    }
    if kind != ProviderKind::Offline && api_key.trim().is_empty() {
        bail!("API key is required");
    }
    Ok(())
}

impl EndpointRegistry {
    pub fn new(db: Database, router: Arc<ProviderRouter>) -> Self {
        Self {
            db,
            router,
            endpoints: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Endpoint>> {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Endpoint>> {
        self.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Load endpoints from the database. With none flagged active, the first one is.
    pub async fn load(&self) -> Result<()> {
        let mut endpoints = self
            .db
            .list_endpoints()
            .await
            .context("Failed to load endpoints")?;

        if !endpoints.is_empty() && !endpoints.iter().any(|e| e.is_active) {
            endpoints[0].is_active = true;
            let id = endpoints[0].id.clone();
            self.db.set_active_endpoint(Some(&id)).await?;
        }

        tracing::debug!("Loaded {} endpoints", endpoints.len());
        *self.write() = endpoints;
        Ok(())
    }

    pub fn list(&self) -> Vec<Endpoint> {
        self.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Endpoint> {
        self.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn active(&self) -> Option<Endpoint> {
        self.read().iter().find(|e| e.is_active).cloned()
    }

    pub async fn add(&self, new: NewEndpoint) -> Result<Endpoint> {
        validate(&new.name, new.kind, &new.api_key)?;
        let base_url = normalize_base_url(&new.base_url)?;
        if let Some(rag) = &new.rag {
            normalize_base_url(&rag.base_url).context("Invalid retrieval service URL")?;
        }

        let now = Utc::now();
        let mut endpoint = Endpoint {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            kind: new.kind,
            base_url,
            api_key: new.api_key.trim().to_string(),
            model: new.model.trim().to_string(),
            is_active: false,
            rag: new.rag,
            created_at: now,
            updated_at: now,
        };

        self.db
            .insert_endpoint(&endpoint)
            .await
            .context("Failed to save endpoint")?;

        let first = self.read().is_empty();
        if first {
            self.db.set_active_endpoint(Some(&endpoint.id)).await?;
            endpoint.is_active = true;
        }

        tracing::info!("Added endpoint {} ({})", endpoint.name, endpoint.kind.as_str());
        self.write().push(endpoint.clone());
        Ok(endpoint)
    }

    pub async fn update(&self, id: &str, update: EndpointUpdate) -> Result<Endpoint> {
        let mut endpoint = self.get(id).context("Endpoint not found")?;

        if let Some(name) = update.name {
            endpoint.name = name.trim().to_string();
        }
        if let Some(base_url) = update.base_url {
            endpoint.base_url = normalize_base_url(&base_url)?;
        }
        if let Some(api_key) = update.api_key {
            endpoint.api_key = api_key.trim().to_string();
        }
        if let Some(model) = update.model {
            endpoint.model = model.trim().to_string();
        }
        if let Some(rag) = update.rag {
            if let Some(rag) = &rag {
                normalize_base_url(&rag.base_url).context("Invalid retrieval service URL")?;
            }
            endpoint.rag = rag;
        }
        validate(&endpoint.name, endpoint.kind, &endpoint.api_key)?;
        endpoint.updated_at = Utc::now();

        self.db
            .update_endpoint(&endpoint)
            .await
            .context("Failed to update endpoint")?;

        if let Some(slot) = self.write().iter_mut().find(|e| e.id == id) {
            *slot = endpoint.clone();
        }
        Ok(endpoint)
    }

    /// Remove an endpoint. Removing the active one activates the first remaining.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.get(id).context("Endpoint not found")?;
        self.db
            .delete_endpoint(id)
            .await
            .context("Failed to delete endpoint")?;

        let next_active = {
            let mut endpoints = self.write();
            endpoints.retain(|e| e.id != id);
            if removed.is_active {
                endpoints.first_mut().map(|e| {
                    e.is_active = true;
                    e.id.clone()
                })
            } else {
                None
            }
        };

        if removed.is_active {
            self.db.set_active_endpoint(next_active.as_deref()).await?;
        }
        tracing::info!("Removed endpoint {}", removed.name);
        Ok(())
    }

    pub async fn set_active(&self, id: Option<&str>) -> Result<()> {
        if let Some(id) = id {
            if self.get(id).is_none() {
                bail!("Endpoint not found: {}", id);
            }
        }
        self.db
            .set_active_endpoint(id)
            .await
            .context("Failed to set active endpoint")?;
        for endpoint in self.write().iter_mut() {
            endpoint.is_active = Some(endpoint.id.as_str()) == id;
        }
        Ok(())
    }

    /// Model ids served by the active endpoint, or a built-in list when they cannot be fetched.
    pub async fn fetch_models(&self) -> Vec<String> {
        let Some(endpoint) = self.active() else {
            return fallback_models();
        };
        match self
            .router
            .list_models(&endpoint.kind, &endpoint.api_key, &endpoint.base_url)
            .await
        {
            Ok(models) if !models.is_empty() => models.into_iter().map(|m| m.id).collect(),
            Ok(_) => fallback_models(),
            Err(e) => {
                tracing::warn!("Failed to fetch models from {}: {}", endpoint.name, e);
                fallback_models()
            }
        }
    }

    /// Models the active endpoint advertises for image generation.
    pub async fn fetch_image_models(&self) -> Result<Vec<String>> {
        let endpoint = self.active().context("No API endpoint selected")?;
        let models = self
            .router
            .list_models(&endpoint.kind, &endpoint.api_key, &endpoint.base_url)
            .await
            .context("Failed to fetch image models")?;
        Ok(models
            .into_iter()
            .filter(|m| m.supports(IMAGE_ROUTE))
            .map(|m| m.id)
            .collect())
    }
}

fn fallback_models() -> Vec<String> {
    FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RagSettings;

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(
            Database::new_in_memory().unwrap(),
            Arc::new(ProviderRouter::with_defaults(None)),
        )
    }

    fn new_endpoint(name: &str, kind: ProviderKind, key: &str) -> NewEndpoint {
        NewEndpoint {
            name: name.to_string(),
            kind,
            base_url: "https://api.example.com/v1/".to_string(),
            api_key: key.to_string(),
            model: "gpt-4o".to_string(),
            rag: None,
        }
    }

    #[tokio::test]
    async fn test_first_endpoint_becomes_active() {
        let reg = registry();
        let first = reg
            .add(new_endpoint("One", ProviderKind::OpenAi, "sk-1"))
            .await
            .unwrap();
        let second = reg
            .add(new_endpoint("Two", ProviderKind::OpenAi, "sk-2"))
            .await
            .unwrap();

        assert!(first.is_active);
        assert!(!second.is_active);
        assert_eq!(first.base_url, "https://api.example.com/v1");
        assert_eq!(reg.active().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_validation() {
        let reg = registry();
        assert!(reg
            .add(new_endpoint("", ProviderKind::OpenAi, "sk"))
            .await
            .is_err());
        assert!(reg
            .add(new_endpoint("Key", ProviderKind::OpenAi, " "))
            .await
            .is_err());

        let mut bad_url = new_endpoint("Url", ProviderKind::OpenAi, "sk");
        bad_url.base_url = "not a url".to_string();
        assert!(reg.add(bad_url).await.is_err());

        let mut bad_rag = new_endpoint("Rag", ProviderKind::OpenAi, "sk");
        bad_rag.rag = Some(RagSettings::new("nope"));
        assert!(reg.add(bad_rag).await.is_err());

        // Offline endpoints need no key
        assert!(reg
            .add(new_endpoint("Offline", ProviderKind::Offline, ""))
            .await
            .is_ok());
        assert_eq!(reg.list().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_active_activates_next() {
        let reg = registry();
        let first = reg
            .add(new_endpoint("One", ProviderKind::OpenAi, "sk-1"))
            .await
            .unwrap();
        let second = reg
            .add(new_endpoint("Two", ProviderKind::OpenAi, "sk-2"))
            .await
            .unwrap();

        reg.remove(&first.id).await.unwrap();
        assert_eq!(reg.active().unwrap().id, second.id);

        reg.remove(&second.id).await.unwrap();
        assert!(reg.active().is_none());
    }

    #[tokio::test]
    async fn test_set_active_and_reload() {
        let db = Database::new_in_memory().unwrap();
        let router = Arc::new(ProviderRouter::with_defaults(None));
        let reg = EndpointRegistry::new(db.clone(), router.clone());
        reg.add(new_endpoint("One", ProviderKind::OpenAi, "sk-1"))
            .await
            .unwrap();
        let second = reg
            .add(new_endpoint("Two", ProviderKind::OpenAi, "sk-2"))
            .await
            .unwrap();
        reg.set_active(Some(&second.id)).await.unwrap();
        assert!(reg.set_active(Some("missing")).await.is_err());

        let reloaded = EndpointRegistry::new(db, router);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.active().unwrap().id, second.id);
        assert_eq!(reloaded.list().len(), 2);
    }

    #[tokio::test]
    async fn test_update_endpoint() {
        let reg = registry();
        let ep = reg
            .add(new_endpoint("One", ProviderKind::OpenAi, "sk-1"))
            .await
            .unwrap();
        let updated = reg
            .update(
                &ep.id,
                EndpointUpdate {
                    model: Some("gpt-4o-mini".to_string()),
                    rag: Some(Some(RagSettings::new("http://localhost:9000"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.model, "gpt-4o-mini");
        assert!(reg.get(&ep.id).unwrap().active_rag().is_some());
    }

    #[tokio::test]
    async fn test_fetch_models_falls_back_without_endpoint() {
        let reg = registry();
        assert_eq!(reg.fetch_models().await, fallback_models());
    }

    #[tokio::test]
    async fn test_fetch_models_from_offline_endpoint() {
        let reg = registry();
        reg.add(new_endpoint("Offline", ProviderKind::Offline, ""))
            .await
            .unwrap();
        assert_eq!(reg.fetch_models().await, vec!["offline-stub".to_string()]);
    }
}

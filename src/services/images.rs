use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::providers::types::ImageRequest;
use crate::providers::{ProviderError, ProviderRouter};
use crate::services::endpoints::EndpointRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    Small,
    Medium,
    #[default]
    Square,
    Portrait,
    Landscape,
}

impl ImageSize {
    pub const ALL: [ImageSize; 5] = [
        ImageSize::Small,
        ImageSize::Medium,
        ImageSize::Square,
        ImageSize::Portrait,
        ImageSize::Landscape,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::Small => "256x256",
            ImageSize::Medium => "512x512",
            ImageSize::Square => "1024x1024",
            ImageSize::Portrait => "1024x1792",
            ImageSize::Landscape => "1792x1024",
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ImageSize::ALL
            .into_iter()
            .find(|size| size.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = ImageSize::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown image size {} (expected one of {})", s, valid.join(", "))
            })
    }
}

/// Prompt sent to the image model, with the negative prompt folded in.
pub fn compose_prompt(prompt: &str, negative_prompt: Option<&str>) -> String {
    match negative_prompt.map(str::trim).filter(|n| !n.is_empty()) {
        Some(negative) => format!("{}. Avoid: {}", prompt.trim(), negative),
        None => prompt.trim().to_string(),
    }
}

pub struct ImageGenerator {
    endpoints: Arc<EndpointRegistry>,
    router: Arc<ProviderRouter>,
}

impl ImageGenerator {
    pub fn new(endpoints: Arc<EndpointRegistry>, router: Arc<ProviderRouter>) -> Self {
        Self { endpoints, router }
    }

    /// Generate one image through the active endpoint and return its URL.
    pub async fn generate(
        &self,
        prompt: &str,
        negative_prompt: Option<&str>,
        model: &str,
        size: ImageSize,
    ) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(PipelineError::InvalidInput("Image prompt is empty".to_string()));
        }
        if model.trim().is_empty() {
            return Err(PipelineError::InvalidInput("No image model selected".to_string()));
        }
        let endpoint = self
            .endpoints
            .active()
            .ok_or(PipelineError::NoActiveEndpoint)?;

        let request = ImageRequest {
            api_key: endpoint.api_key.clone(),
            base_url: endpoint.base_url.clone(),
            model: model.trim().to_string(),
            prompt: compose_prompt(prompt, negative_prompt),
            size: size.as_str().to_string(),
        };
        tracing::debug!("Generating {} image with {}", size, request.model);

        let urls = self.router.generate_image(&endpoint.kind, request).await?;
        urls.into_iter().next().ok_or_else(|| {
            ProviderError::InvalidResponse("No image was generated".to_string()).into()
        })
    }
}

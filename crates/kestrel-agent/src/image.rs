use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::{error_for_status, ProviderError};

/// Structured image-generation request derived from the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    /// Provider size string, e.g. `1024x1024`.
    pub size: String,
    pub style: String,
}

/// Image-synthesis backend: prompt + dimensions in, hosted URL out.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, req: &ImageRequest) -> Result<String, ProviderError>;
}

/// Reachability check run against a synthesized URL before it is shown.
#[async_trait]
pub trait UrlProbe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// `HEAD` probe over reqwest. Any 2xx counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UrlProbe for HttpProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), url, "image URL probe rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, url, "image URL probe failed");
                false
            }
        }
    }
}

/// Sizes the images endpoint accepts; anything else falls back to square.
const SIZES: &[&str] = &["1024x1024", "1792x1024", "1024x1792"];

/// Normalise a free-form size hint to one the images endpoint accepts.
pub fn normalize_size(size: &str) -> &'static str {
    let wanted = size.trim().to_ascii_lowercase();
    SIZES
        .iter()
        .copied()
        .find(|s| *s == wanted)
        .unwrap_or_else(|| match wanted.as_str() {
            "landscape" | "wide" => "1792x1024",
            "portrait" | "tall" => "1024x1792",
            _ => "1024x1024",
        })
}

/// OpenAI `/v1/images/generations`.
pub struct OpenAiImageProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiImageProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    fn name(&self) -> &str {
        "openai-images"
    }

    async fn generate(&self, req: &ImageRequest) -> Result<String, ProviderError> {
        let url = format!("{}/v1/images/generations", self.base_url);
        let mut prompt = req.prompt.clone();
        if !req.style.trim().is_empty() {
            prompt.push_str(&format!("\n\nStyle: {}", req.style.trim()));
        }
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "size": normalize_size(&req.size),
            "n": 1,
        });

        debug!(model = %self.model, size = %req.size, "requesting image synthesis");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let resp = error_for_status(resp, "openai-images").await?;

        let parsed: ImagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| ProviderError::Parse("image response carried no url".to_string()))
    }
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: Option<String>,
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{error_for_status, ProviderError};

/// Coarse recency bucket used to scope a retrieval query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Day,
    Week,
    Month,
    Year,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Day => "day",
            TimeRange::Week => "week",
            TimeRange::Month => "month",
            TimeRange::Year => "year",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub time_range: Option<TimeRange>,
    pub max_results: usize,
}

/// One ranked retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

/// Retrieval backend. Results come back best-first.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ProviderError>;
}

/// Tavily-compatible `POST {base}/search`.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TavilySearch {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.tavily.com".to_string()),
        }
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ProviderError> {
        let url = format!("{}/search", self.base_url);
        let mut body = serde_json::json!({
            "query": query.query,
            "max_results": query.max_results,
            "search_depth": "basic",
        });
        if let Some(range) = query.time_range {
            body["time_range"] = serde_json::json!(range.as_str());
        }

        debug!(query = %query.query, time_range = ?query.time_range, "running retrieval search");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let resp = error_for_status(resp, "tavily").await?;

        let parsed: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(rank(parsed.results))
    }
}

/// Best-first ordering by score; stable for ties.
pub fn rank(mut results: Vec<SearchResult>) -> Vec<SearchResult> {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

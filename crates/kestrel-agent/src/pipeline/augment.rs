//! Augmentation router: per-turn decision to synthesize an image and/or
//! inject retrieval results before the model answers.
//!
//! Every failure here is absorbed: a broken classifier, search backend or
//! image endpoint means "no augmentation", never a failed turn.

use serde::Deserialize;
use tracing::{debug, info, warn};

use kestrel_core::config::PipelineConfig;
use kestrel_core::{ContentPart, ConversationLog, Role, Turn};

use crate::image::{ImageProvider, ImageRequest, UrlProbe};
use crate::provider::{with_timeout, LlmProvider, ProviderError, ResponseSchema};
use crate::search::{SearchProvider, SearchQuery, SearchResult, TimeRange};

use super::budget::exceeds;
use super::structured::{recent_transcript, structured_call};

/// Conversation turns shown to the classifiers.
const CLASSIFY_WINDOW: usize = 6;

/// Per-result content cap in the injected context turn.
const RESULT_CONTENT_CHARS: usize = 600;

const IMAGE_NEED_INSTRUCTION: &str = concat!(
    "Decide whether the assistant should generate an image to answer the ",
    "latest user message. Only answer true when the user explicitly asks for a ",
    "picture, drawing, illustration or similar visual. If true, give a concise ",
    "English image prompt."
);

const IMAGE_SPEC_INSTRUCTION: &str = concat!(
    "Turn the image request into a generation spec: the subject to draw, a size ",
    "(1024x1024, 1792x1024 or 1024x1792) and a short style description."
);

const SEARCH_NEED_INSTRUCTION: &str = concat!(
    "Decide whether answering the latest user message needs fresh information ",
    "from a web search (news, prices, recent events, facts likely to have ",
    "changed). If so, give a search query and how recent the results must be: ",
    "day, week, month, year, or null when recency does not matter."
);

/// Combined per-turn decision. Produced fresh for each user turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AugmentationDecision {
    pub needs_image: bool,
    pub image_prompt: Option<String>,
    pub needs_search: bool,
    pub search_query: Option<String>,
    pub time_range: Option<TimeRange>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageDecision {
    pub needs_image: bool,
    pub prompt: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchDecision {
    pub needs_search: bool,
    pub query: Option<String>,
    pub time_range: Option<TimeRange>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    NotNeeded,
    Generated { url: String, prompt: String },
    /// User-visible failure; nothing was added to the log.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationReport {
    pub decision: AugmentationDecision,
    pub image: ImageOutcome,
    /// Retrieval results injected into the log.
    pub search_results: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageNeedReply {
    need_image: bool,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct ImageSpecReply {
    subject: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    style: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchNeedReply {
    need_search: bool,
    #[serde(default)]
    query: String,
    #[serde(default)]
    time_range: Option<TimeRange>,
    #[serde(default)]
    reason: String,
}

fn image_need_schema() -> ResponseSchema {
    ResponseSchema::new(
        "image_decision",
        serde_json::json!({
            "type": "object",
            "properties": {
                "needImage": { "type": "boolean" },
                "prompt": { "type": "string" },
                "reason": { "type": "string" }
            },
            "required": ["needImage", "prompt", "reason"],
            "additionalProperties": false
        }),
    )
}

fn image_spec_schema() -> ResponseSchema {
    ResponseSchema::new(
        "image_spec",
        serde_json::json!({
            "type": "object",
            "properties": {
                "subject": { "type": "string" },
                "size": { "type": "string", "enum": ["1024x1024", "1792x1024", "1024x1792"] },
                "style": { "type": "string" }
            },
            "required": ["subject", "size", "style"],
            "additionalProperties": false
        }),
    )
}

fn search_need_schema() -> ResponseSchema {
    ResponseSchema::new(
        "search_decision",
        serde_json::json!({
            "type": "object",
            "properties": {
                "needSearch": { "type": "boolean" },
                "query": { "type": "string" },
                "timeRange": {
                    "type": ["string", "null"],
                    "enum": ["day", "week", "month", "year", null]
                },
                "reason": { "type": "string" }
            },
            "required": ["needSearch", "query", "timeRange", "reason"],
            "additionalProperties": false
        }),
    )
}

pub struct AugmentationRouter<'a> {
    llm: &'a dyn LlmProvider,
    search: Option<&'a dyn SearchProvider>,
    images: Option<&'a dyn ImageProvider>,
    probe: &'a dyn UrlProbe,
    config: &'a PipelineConfig,
    max_results: usize,
}

impl<'a> AugmentationRouter<'a> {
    pub fn new(
        llm: &'a dyn LlmProvider,
        probe: &'a dyn UrlProbe,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            llm,
            search: None,
            images: None,
            probe,
            config,
            max_results: 5,
        }
    }

    pub fn with_search(mut self, search: &'a dyn SearchProvider, max_results: usize) -> Self {
        self.search = Some(search);
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_images(mut self, images: &'a dyn ImageProvider) -> Self {
        self.images = Some(images);
        self
    }

    fn image_enabled(&self) -> bool {
        self.config.image_generation_enabled && self.images.is_some()
    }

    fn search_enabled(&self) -> bool {
        self.config.search_enabled && self.search.is_some()
    }

    /// Run both checks, synthesize / retrieve as decided, and update `log`.
    ///
    /// Retrieval context lands immediately before the final user turn; a
    /// generated image is appended after it as a structured assistant turn.
    pub async fn augment(&self, log: &mut ConversationLog) -> AugmentationReport {
        let (image_decision, search_decision) =
            tokio::join!(self.check_image_need(log), self.check_search_need(log));

        let (image, results) = tokio::join!(
            self.synthesize(&image_decision),
            self.fetch(&search_decision)
        );

        let search_results = match search_decision.query.as_deref() {
            Some(query) if !results.is_empty() => self.inject(log, query, results),
            _ => 0,
        };

        if let ImageOutcome::Generated { url, prompt } = &image {
            log.push(Turn::with_parts(
                Role::Assistant,
                vec![
                    ContentPart::Text {
                        text: format!("Generated image: {prompt}"),
                    },
                    ContentPart::ImageRef { url: url.clone() },
                ],
            ));
        }

        let reason = [image_decision.reason.as_str(), search_decision.reason.as_str()]
            .iter()
            .filter(|r| !r.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("; ");

        AugmentationReport {
            decision: AugmentationDecision {
                needs_image: image_decision.needs_image,
                image_prompt: image_decision.prompt,
                needs_search: search_decision.needs_search,
                search_query: search_decision.query,
                time_range: search_decision.time_range,
                reason,
            },
            image,
            search_results,
        }
    }

    /// Classify whether the latest turn calls for an image. Fails closed.
    pub async fn check_image_need(&self, log: &ConversationLog) -> ImageDecision {
        if !self.image_enabled() {
            return ImageDecision::default();
        }
        let reply: Result<ImageNeedReply, ProviderError> = structured_call(
            self.llm,
            &self.config.utility_model,
            self.config.classify_timeout(),
            IMAGE_NEED_INSTRUCTION,
            recent_transcript(log, CLASSIFY_WINDOW),
            image_need_schema(),
        )
        .await;

        match reply {
            Ok(r) if r.need_image && !r.prompt.trim().is_empty() => ImageDecision {
                needs_image: true,
                prompt: Some(r.prompt.trim().to_string()),
                reason: r.reason,
            },
            Ok(r) => ImageDecision {
                needs_image: false,
                prompt: None,
                reason: r.reason,
            },
            Err(e) => {
                warn!(error = %e, "image classification failed, skipping image");
                ImageDecision::default()
            }
        }
    }

    /// Classify whether the latest turn needs retrieval. Fails closed.
    pub async fn check_search_need(&self, log: &ConversationLog) -> SearchDecision {
        if !self.search_enabled() {
            return SearchDecision::default();
        }
        let reply: Result<SearchNeedReply, ProviderError> = structured_call(
            self.llm,
            &self.config.utility_model,
            self.config.classify_timeout(),
            SEARCH_NEED_INSTRUCTION,
            recent_transcript(log, CLASSIFY_WINDOW),
            search_need_schema(),
        )
        .await;

        match reply {
            Ok(r) if r.need_search && !r.query.trim().is_empty() => SearchDecision {
                needs_search: true,
                query: Some(r.query.trim().to_string()),
                time_range: r.time_range,
                reason: r.reason,
            },
            Ok(r) => SearchDecision {
                reason: r.reason,
                ..SearchDecision::default()
            },
            Err(e) => {
                warn!(error = %e, "search classification failed, skipping search");
                SearchDecision::default()
            }
        }
    }

    /// Derive an image spec, generate it and verify the URL is reachable,
    /// all within the image timeout.
    pub async fn synthesize(&self, decision: &ImageDecision) -> ImageOutcome {
        let (Some(images), Some(prompt)) = (self.images, decision.prompt.as_deref()) else {
            return ImageOutcome::NotNeeded;
        };
        if !decision.needs_image {
            return ImageOutcome::NotNeeded;
        }

        let attempt = with_timeout(self.config.image_timeout(), async {
            let spec: ImageSpecReply = structured_call(
                self.llm,
                &self.config.utility_model,
                self.config.classify_timeout(),
                IMAGE_SPEC_INSTRUCTION,
                prompt.to_string(),
                image_spec_schema(),
            )
            .await?;

            let req = ImageRequest {
                prompt: if spec.subject.trim().is_empty() {
                    prompt.to_string()
                } else {
                    spec.subject
                },
                size: spec.size,
                style: spec.style,
            };
            let url = images.generate(&req).await?;
            if !self.probe.is_reachable(&url).await {
                return Err(ProviderError::Unavailable(format!(
                    "generated image is not reachable: {url}"
                )));
            }
            Ok::<_, ProviderError>(url)
        })
        .await;

        match attempt {
            Ok(url) => {
                info!(provider = images.name(), "image generated");
                ImageOutcome::Generated {
                    url,
                    prompt: prompt.to_string(),
                }
            }
            Err(e) => {
                warn!(error = %e, provider = images.name(), "image generation failed");
                ImageOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn fetch(&self, decision: &SearchDecision) -> Vec<SearchResult> {
        let (Some(search), Some(query)) = (self.search, decision.query.as_deref()) else {
            return Vec::new();
        };
        if !decision.needs_search {
            return Vec::new();
        }

        let q = SearchQuery {
            query: query.to_string(),
            time_range: decision.time_range,
            max_results: self.max_results,
        };
        match with_timeout(self.config.search_timeout(), search.search(&q)).await {
            Ok(results) => {
                debug!(provider = search.name(), count = results.len(), "search results received");
                results
            }
            Err(e) => {
                warn!(error = %e, provider = search.name(), "search failed, answering without it");
                Vec::new()
            }
        }
    }

    /// Insert a context turn before the final user turn, dropping the
    /// lowest-ranked results until it fits the budget.
    fn inject(&self, log: &mut ConversationLog, query: &str, mut results: Vec<SearchResult>) -> usize {
        results.truncate(self.max_results);
        while !results.is_empty() {
            let text = format_results(query, &results);
            if !exceeds(log, &text, self.config.max_context_tokens) {
                let count = results.len();
                log.insert_before_last(Turn::ephemeral(Role::User, text));
                return count;
            }
            results.pop();
        }
        info!(query, "search results do not fit the context budget, skipping");
        0
    }
}

/// Render results as a context block for the model.
pub fn format_results(query: &str, results: &[SearchResult]) -> String {
    let mut out = format!(
        "Web search results for \"{query}\". Use them if relevant and cite the URLs you rely on.\n"
    );
    for (i, r) in results.iter().enumerate() {
        let content: String = r.content.chars().take(RESULT_CONTENT_CHARS).collect();
        out.push_str(&format!("\n[{}] {}\n{}\n{}\n", i + 1, r.title, r.url, content.trim()));
    }
    out
}

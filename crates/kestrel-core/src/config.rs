use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Bare environment names that map straight onto the `[pipeline]` table.
pub const PIPELINE_ENV_KEYS: &[&str] = &[
    "MAX_CONTEXT_TOKENS",
    "FLUSH_INTERVAL_MS",
    "MAX_MESSAGE_LENGTH",
    "IMAGE_GENERATION_ENABLED",
    "SEARCH_ENABLED",
    "DEEP_THINKING_MODEL",
];

/// Top-level config (kestrel.toml + KESTREL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Knobs for one turn of the reply pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default completion model.
    #[serde(default = "default_model")]
    pub model: String,
    /// Model used instead of `model` when a session has reasoning mode on.
    #[serde(default = "default_deep_thinking_model")]
    pub deep_thinking_model: String,
    /// Model for classification, summarisation and follow-up prediction.
    #[serde(default = "default_utility_model")]
    pub utility_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Estimated-token ceiling that triggers compaction.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Per-message ceiling in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// How far past the ceiling a split may move to close a code-fence line.
    #[serde(default = "default_split_lookahead")]
    pub split_lookahead: usize,
    #[serde(default = "bool_true")]
    pub image_generation_enabled: bool,
    #[serde(default = "bool_true")]
    pub search_enabled: bool,
    #[serde(default = "bool_true")]
    pub follow_ups_enabled: bool,
    #[serde(default = "default_completion_max_tokens")]
    pub completion_max_tokens: u32,
    #[serde(default = "default_classify_timeout_ms")]
    pub classify_timeout_ms: u64,
    #[serde(default = "default_summary_timeout_ms")]
    pub summary_timeout_ms: u64,
    /// Longest silence tolerated between two streamed fragments.
    #[serde(default = "default_completion_idle_timeout_ms")]
    pub completion_idle_timeout_ms: u64,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    /// Covers both synthesis and the reachability probe.
    #[serde(default = "default_image_timeout_ms")]
    pub image_timeout_ms: u64,
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }

    pub fn completion_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_idle_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }

    /// Completion model for a session, honouring its reasoning-mode flag.
    pub fn completion_model(&self, reasoning_mode: bool) -> &str {
        if reasoning_mode {
            &self.deep_thinking_model
        } else {
            &self.model
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            deep_thinking_model: default_deep_thinking_model(),
            utility_model: default_utility_model(),
            image_model: default_image_model(),
            system_prompt: default_system_prompt(),
            max_context_tokens: default_max_context_tokens(),
            flush_interval_ms: default_flush_interval_ms(),
            max_message_length: default_max_message_length(),
            split_lookahead: default_split_lookahead(),
            image_generation_enabled: true,
            search_enabled: true,
            follow_ups_enabled: true,
            completion_max_tokens: default_completion_max_tokens(),
            classify_timeout_ms: default_classify_timeout_ms(),
            summary_timeout_ms: default_summary_timeout_ms(),
            completion_idle_timeout_ms: default_completion_idle_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
            image_timeout_ms: default_image_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    /// OpenAI-compatible endpoint used for chat, classification and images.
    pub openai: Option<OpenAiProviderConfig>,
    /// Retrieval search endpoint (Tavily-compatible).
    pub search: Option<SearchProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProviderConfig {
    pub api_key: String,
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    /// When true, guild messages are only processed when the bot is @mentioned.
    #[serde(default)]
    pub require_mention: bool,
    /// When true, direct messages (DMs) are accepted.
    #[serde(default = "bool_true")]
    pub dm_allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Idle-session cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Sessions untouched for this many days are deleted. `0` disables the sweep.
    #[serde(default = "default_idle_days")]
    pub idle_days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            idle_days: default_idle_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_deep_thinking_model() -> String {
    "o3-mini".to_string()
}
fn default_utility_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_image_model() -> String {
    "dall-e-3".to_string()
}
fn default_system_prompt() -> String {
    concat!(
        "You are a friendly assistant chatting inside a community server. ",
        "Answer in the language the user writes in. Keep replies focused and use ",
        "Markdown sparingly: fenced code blocks for code, short lists where helpful."
    )
    .to_string()
}
fn default_max_context_tokens() -> usize {
    8_000
}
fn default_flush_interval_ms() -> u64 {
    500
}
fn default_max_message_length() -> usize {
    1_900
}
fn default_split_lookahead() -> usize {
    80
}
fn default_completion_max_tokens() -> u32 {
    2_048
}
fn default_classify_timeout_ms() -> u64 {
    15_000
}
fn default_summary_timeout_ms() -> u64 {
    30_000
}
fn default_completion_idle_timeout_ms() -> u64 {
    60_000
}
fn default_search_timeout_ms() -> u64 {
    15_000
}
fn default_image_timeout_ms() -> u64 {
    90_000
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_search_base_url() -> String {
    "https://api.tavily.com".to_string()
}
fn default_search_max_results() -> usize {
    5
}
fn default_idle_days() -> u32 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    3_600
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kestrel/kestrel.db", home)
}

impl KestrelConfig {
    /// Layered provider chain: defaults, TOML file, `KESTREL_*` env
    /// (nested with `__`), then the bare pipeline env names.
    pub fn figment(config_path: Option<&str>) -> Figment {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::from(Serialized::defaults(KestrelConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KESTREL_").split("__"))
            .merge(
                Env::raw()
                    .only(PIPELINE_ENV_KEYS)
                    .map(|key| format!("pipeline.{}", key.as_str().to_ascii_lowercase()).into()),
            )
    }

    /// Load config from a TOML file with env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.kestrel/kestrel.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        Self::from_figment(Self::figment(config_path))
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::KestrelError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.kestrel/kestrel.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cfg = KestrelConfig::default();
        assert_eq!(cfg.pipeline.flush_interval_ms, 500);
        assert_eq!(cfg.pipeline.max_message_length, 1_900);
        assert!(cfg.discord.is_none());
        assert!(cfg.providers.openai.is_none());
    }

    #[test]
    fn toml_overrides_pipeline_table() {
        let figment = Figment::from(Serialized::defaults(KestrelConfig::default())).merge(
            Toml::string(
                r#"
                [pipeline]
                max_context_tokens = 50
                search_enabled = false

                [providers.openai]
                api_key = "sk-test"

                [discord]
                bot_token = "tok"
                "#,
            ),
        );
        let cfg = KestrelConfig::from_figment(figment).unwrap();
        assert_eq!(cfg.pipeline.max_context_tokens, 50);
        assert!(!cfg.pipeline.search_enabled);
        assert!(cfg.pipeline.image_generation_enabled);
        let openai = cfg.providers.openai.unwrap();
        assert_eq!(openai.base_url, "https://api.openai.com");
        let discord = cfg.discord.unwrap();
        assert!(discord.dm_allowed);
        assert!(!discord.require_mention);
    }

    #[test]
    fn bare_env_names_map_onto_pipeline() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MAX_CONTEXT_TOKENS", "1234");
            jail.set_env("FLUSH_INTERVAL_MS", "250");
            jail.set_env("MAX_MESSAGE_LENGTH", "1500");
            jail.set_env("IMAGE_GENERATION_ENABLED", "false");
            jail.set_env("SEARCH_ENABLED", "false");
            jail.set_env("DEEP_THINKING_MODEL", "o1");
            jail.set_env("KESTREL_PIPELINE__MODEL", "gpt-4.1");

            let cfg = KestrelConfig::load(Some("missing.toml")).expect("config loads");
            let pipeline = cfg.pipeline;
            assert_eq!(pipeline.max_context_tokens, 1234);
            assert_eq!(pipeline.flush_interval_ms, 250);
            assert_eq!(pipeline.max_message_length, 1500);
            assert!(!pipeline.image_generation_enabled);
            assert!(!pipeline.search_enabled);
            assert_eq!(pipeline.deep_thinking_model, "o1");
            assert_eq!(pipeline.model, "gpt-4.1");
            Ok(())
        });
    }

    #[test]
    fn completion_model_follows_reasoning_flag() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.completion_model(false), "gpt-4o-mini");
        assert_eq!(cfg.completion_model(true), "o3-mini");
    }

    #[test]
    fn flush_interval_never_zero() {
        let cfg = PipelineConfig {
            flush_interval_ms: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.flush_interval(), Duration::from_millis(1));
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use kestrel_agent::image::OpenAiImageProvider;
use kestrel_agent::openai::OpenAiProvider;
use kestrel_agent::pipeline::TurnPipeline;
use kestrel_agent::provider::LlmProvider;
use kestrel_agent::search::TavilySearch;
use kestrel_core::config::{KestrelConfig, RetentionConfig};
use kestrel_sessions::SqliteSessionStore;

/// Kestrel chat gateway: streams model replies into Discord.
#[derive(Parser, Debug)]
#[command(name = "kestrel-gateway", version, about)]
struct Cli {
    /// Path to the TOML config file (default: ~/.kestrel/kestrel.toml)
    #[arg(long, env = "KESTREL_CONFIG")]
    config: Option<String>,

    /// Load and validate the config, print the effective pipeline settings, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kestrel_gateway=info,kestrel_agent=info,kestrel_discord=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = match KestrelConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(code = e.code(), error = %e, "config load failed");
            return Err(e.into());
        }
    };

    if cli.check {
        println!("{:#?}", config.pipeline);
        return Ok(());
    }

    // initialize SQLite database
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteSessionStore::open(db_path).context("opening session store")?);

    let pipeline = Arc::new(build_pipeline(&config, store.clone())?);

    spawn_retention_sweeper(store, &config.retention);

    let discord_cfg = config
        .discord
        .as_ref()
        .context("no [discord] section configured; nothing to serve")?;
    let adapter = kestrel_discord::DiscordAdapter::new(discord_cfg, pipeline)?;
    info!("Discord bot starting");
    adapter.run().await;
    Ok(())
}

/// Wire providers from config into a turn pipeline.
///
/// Chat, classification and image synthesis share the OpenAI-compatible
/// endpoint; `OPENAI_API_KEY` is used when `[providers.openai]` is absent.
fn build_pipeline(
    config: &KestrelConfig,
    store: Arc<SqliteSessionStore>,
) -> anyhow::Result<TurnPipeline> {
    let (api_key, base_url) = match &config.providers.openai {
        Some(openai) => (openai.api_key.clone(), Some(openai.base_url.clone())),
        None => (
            std::env::var("OPENAI_API_KEY")
                .context("no [providers.openai] configured and OPENAI_API_KEY unset")?,
            None,
        ),
    };

    info!(
        model = %config.pipeline.model,
        deep_thinking_model = %config.pipeline.deep_thinking_model,
        utility_model = %config.pipeline.utility_model,
        "LLM provider: OpenAI-compatible"
    );
    let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(api_key.clone(), base_url.clone()));
    let mut pipeline = TurnPipeline::new(config.pipeline.clone(), llm, store);

    if config.pipeline.search_enabled {
        match &config.providers.search {
            Some(search) => {
                info!(base_url = %search.base_url, max_results = search.max_results, "search provider enabled");
                pipeline = pipeline.with_search(
                    Arc::new(TavilySearch::new(
                        search.api_key.clone(),
                        Some(search.base_url.clone()),
                    )),
                    search.max_results,
                );
            }
            None => warn!("search enabled but [providers.search] missing; searching disabled"),
        }
    }

    if config.pipeline.image_generation_enabled {
        info!(model = %config.pipeline.image_model, "image generation enabled");
        pipeline = pipeline.with_images(Arc::new(OpenAiImageProvider::new(
            api_key,
            base_url,
            config.pipeline.image_model.clone(),
        )));
    }

    Ok(pipeline)
}

/// Periodically delete sessions idle longer than the retention window.
fn spawn_retention_sweeper(store: Arc<SqliteSessionStore>, retention: &RetentionConfig) {
    if retention.idle_days == 0 {
        info!("retention sweeper disabled");
        return;
    }
    let idle = chrono::Duration::days(i64::from(retention.idle_days));
    let every = Duration::from_secs(retention.sweep_interval_secs.max(60));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match store.prune_idle(idle) {
                Ok(0) => {}
                Ok(removed) => info!(removed, "retention sweep complete"),
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
        }
    });
}

/// Create the database directory. Failure is logged; opening the store
/// reports the fatal error.
fn ensure_parent_dir(path: &str) -> bool {
    let Some(parent) = std::path::Path::new(path).parent() else {
        return true;
    };
    if parent.as_os_str().is_empty() {
        return true;
    }
    match std::fs::create_dir_all(parent) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, dir = %parent.display(), "could not create database directory");
            false
        }
    }
}

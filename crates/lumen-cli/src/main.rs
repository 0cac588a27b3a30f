mod chat;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lumen_core::{EngineKind, LumenConfig, ModelCatalog, Theme};
use lumen_llm::OllamaEngine;
use lumen_offline::{
    CacheStorage, HttpNetwork, OfflineCache, Request, Url, CACHE_PREFIX, OFFLINE_DOCUMENT,
};
use lumen_store::{SettingsService, SqliteStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Lumen - local LLM chat", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat {
        /// Model ID to load instead of the saved one
        #[arg(short, long)]
        model: Option<String>,

        /// Also print info-level log entries
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available models
    Models {
        /// Ask Ollama for installed models instead of the configured catalog
        #[arg(long)]
        installed: bool,
    },

    /// Show saved settings and engine
    Status {
        /// Print settings as JSON
        #[arg(long)]
        json: bool,
    },

    /// Set the color theme
    Theme {
        #[arg(value_parser = ["light", "dark", "toggle"])]
        choice: String,
    },

    /// Install and activate the offline shell cache against a live server
    OfflineDemo {
        /// URL the chat shell is served under
        #[arg(long, default_value = "http://localhost:8080/")]
        scope: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = LumenConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Chat { model, verbose }) => {
            let settings = open_settings(&config)?;
            chat::run(config, settings, model, verbose).await?
        }
        None => {
            let settings = open_settings(&config)?;
            chat::run(config, settings, None, false).await?
        }
        Some(Commands::Models { installed }) => cmd_models(&config, installed).await?,
        Some(Commands::Status { json }) => cmd_status(&config, json).await?,
        Some(Commands::Theme { choice }) => cmd_theme(&config, &choice)?,
        Some(Commands::OfflineDemo { scope }) => cmd_offline_demo(&scope).await?,
    }

    Ok(())
}

fn open_store(config: &LumenConfig) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open(&config.storage.resolved_db_path())?))
}

fn open_settings(config: &LumenConfig) -> Result<SettingsService> {
    Ok(SettingsService::new(open_store(config)?))
}

fn ollama(config: &LumenConfig) -> OllamaEngine {
    OllamaEngine::new(&config.engine.host)
        .with_request_timeout(Duration::from_secs(config.engine.request_timeout_secs))
}

/// Installed Ollama models when reachable, else the configured catalog.
pub(crate) async fn resolve_catalog(config: &LumenConfig) -> ModelCatalog {
    if config.engine.kind != EngineKind::Ollama {
        return config.catalog.clone();
    }

    match ollama(config).list_models().await {
        Ok(models) if !models.is_empty() => ModelCatalog::new(models),
        Ok(_) => {
            tracing::warn!("Ollama has no models installed, using configured catalog");
            config.catalog.clone()
        }
        Err(e) => {
            tracing::warn!("Could not list Ollama models ({}), using configured catalog", e);
            config.catalog.clone()
        }
    }
}

pub(crate) fn print_catalog(catalog: &ModelCatalog, current: Option<&str>) {
    println!();
    println!("Available Models:");
    println!("{:-<72}", "");
    println!("  {:<3} {:<28} {:<28} {}", "#", "ID", "Name", "Size");
    println!("{:-<72}", "");
    for (i, m) in catalog.models().iter().enumerate() {
        let marker = if Some(m.id.as_str()) == current { "*" } else { " " };
        println!(
            "{} {:<3} {:<28} {:<28} {}",
            marker,
            i + 1,
            m.id,
            m.display_name,
            m.resource_hint
        );
    }
    println!();
}

async fn cmd_models(config: &LumenConfig, installed: bool) -> Result<()> {
    if installed {
        let models = ollama(config).list_models().await?;
        print_catalog(&ModelCatalog::new(models), None);
    } else {
        print_catalog(&config.catalog, None);
    }
    Ok(())
}

async fn cmd_status(config: &LumenConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let settings = SettingsService::new(store.clone());
    let catalog = resolve_catalog(config).await;
    let saved = settings.load(&catalog, Theme::default())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
        return Ok(());
    }

    println!("System Status:");
    println!("{:-<40}", "");
    println!("  Engine:      {:?}", config.engine.kind);
    if config.engine.kind == EngineKind::Ollama {
        println!("  Ollama Host: {}", config.engine.host);
    }
    if let Some(path) = store.db_path() {
        println!("  Database:    {}", path.display());
    }
    println!("  Model:       {}", saved.model_id);
    println!("  Theme:       {} ({})", saved.theme, saved.theme.accent_color());

    let stored = store.list()?;
    if !stored.is_empty() {
        println!();
        println!("Stored Settings:");
        println!("{:-<40}", "");
        for (key, value) in stored {
            println!("  {:<16} {}", key, value);
        }
    }
    Ok(())
}

fn cmd_theme(config: &LumenConfig, choice: &str) -> Result<()> {
    let settings = open_settings(config)?;
    let current = settings.theme(Theme::default())?;
    let theme = chat::next_theme(current, choice).map_err(anyhow::Error::msg)?;
    settings.save_theme(theme)?;
    println!("Theme set to {}.", theme);
    Ok(())
}

async fn cmd_offline_demo(scope: &str) -> Result<()> {
    let scope = Url::parse(scope)?;
    let storage = Arc::new(CacheStorage::new());

    // Leftover from an older build, evicted on activate.
    storage.open(&format!("{}-v1.0.2", CACHE_PREFIX));

    let cache = OfflineCache::new(scope, storage.clone(), Arc::new(HttpNetwork::new()))?;
    cache.install().await?;
    let deleted = cache.activate();

    println!("Offline Cache:");
    println!("{:-<40}", "");
    println!(
        "  Active cache: {} ({} entries)",
        cache.cache_name(),
        storage.entry_count(cache.cache_name())
    );
    println!("  Evicted:      {}", deleted.join(", "));
    println!("  Caches:       {}", storage.keys().join(", "));

    let shell = cache
        .handle_fetch(&Request::navigate(cache.shell_url().clone()))
        .await?;
    if shell.text() == OFFLINE_DOCUMENT {
        println!("  Shell:        unavailable (offline page served)");
    } else {
        println!("  Shell:        {} bytes, status {}", shell.body.len(), shell.status);
    }
    Ok(())
}

//! Strata daemon - tiered memory engine with background maintenance

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use strata::Engine;
use strata::StrataError;
use strata::config::Config;
use strata::error::Result;

/// Strata - tiered memory storage with sealed archives and decaying significance
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Tiered memory storage with sealed archives and decaying significance")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the engine with periodic rescoring until interrupted (default command)
    #[command(name = "serve")]
    Serve,

    /// Print tier health, collection and index statistics as JSON
    #[command(name = "status")]
    Status,

    /// Run one significance rescore pass
    #[command(name = "rescore")]
    Rescore,

    /// Rebuild the fast index from the semantic store
    #[command(name = "rebuild-index")]
    RebuildIndex,

    /// Re-embed a collection written by a different embedding provider
    #[command(name = "migrate")]
    Migrate {
        /// Collection name
        collection: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Status) => status(config).await,
        Some(Command::Rescore) => rescore(config).await,
        Some(Command::RebuildIndex) => rebuild_index(config).await,
        Some(Command::Migrate { collection }) => migrate(config, &collection).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_config(path: &Path) -> Result<Config> {
    tracing::info!("Loading config from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        StrataError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml(&content)
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        return read_config(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".strata").join("config.toml")),
        dirs::config_dir().map(|c| c.join("strata").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            return read_config(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

async fn open_engine(config: Config) -> Result<Engine> {
    let data_dir = &config.storage.data_dir;
    tracing::info!("Initializing storage at: {}", data_dir.display());
    std::fs::create_dir_all(data_dir).map_err(|e| {
        StrataError::Storage(format!(
            "Failed to create data directory {}: {}",
            data_dir.display(),
            e
        ))
    })?;

    tracing::info!("Opening engine (the embedding model may take a moment on first run)...");
    Engine::open(config).await
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting Strata daemon");
    let engine = Arc::new(open_engine(config).await?);
    let rescorer = engine.spawn_rescorer();

    tracing::info!("Engine ready; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| StrataError::Storage(format!("Failed to listen for shutdown signal: {e}")))?;

    tracing::info!("Shutting down");
    rescorer.abort();
    engine.shutdown().await?;
    tracing::info!("Strata daemon stopped");
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let status = engine.status().await?;
    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| StrataError::Serialization(e.to_string()))?;
    println!("{json}");
    engine.shutdown().await
}

async fn rescore(config: Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let report = engine.rescore().await?;
    println!(
        "Rescored {} records: {} updated, {} below floor",
        report.scanned, report.updated, report.below_floor
    );
    for collection in &report.skipped_collections {
        println!("Skipped {collection}: needs migration");
    }
    engine.shutdown().await
}

async fn rebuild_index(config: Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let generation = engine.rebuild_fast_index().await?;
    println!("Fast index rebuilt (generation {generation})");
    engine.shutdown().await
}

async fn migrate(config: Config, collection: &str) -> Result<()> {
    let engine = open_engine(config).await?;
    let migrated = engine.migrate_collection(collection).await?;
    println!("Migrated {migrated} entries in {collection}");
    engine.shutdown().await
}

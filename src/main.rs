mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use technicia_index::{ClearAck, DocumentIndexer, IndexWatcher, Retriever};
use technicia_llm::claude::ClaudeProvider;
use technicia_llm::voyage::VoyageProvider;
use technicia_memory::document::TextSplitter;
use technicia_memory::{DedupIndex, Distance, DocumentStore, EmbeddingGateway, QdrantOps};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "technicia",
    version,
    about = "Index technical PDFs into Qdrant and answer questions about them"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a PDF file or every PDF under a directory.
    Index {
        /// Defaults to `watcher.docs_path`.
        path: Option<PathBuf>,
    },
    /// Ask a question against the indexed documents.
    Search {
        query: String,
        #[arg(long)]
        limit: Option<u64>,
        /// Minimum similarity score; -1 disables filtering.
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f32>,
    },
    /// Remove every chunk of the named file.
    Delete { file_name: String },
    /// List indexed files with their chunk counts.
    Files,
    /// Remove every indexed chunk and recreate an empty collection.
    Clear {
        /// Required; clearing cannot be undone.
        #[arg(long)]
        yes: bool,
    },
    /// Index the docs directory and keep it in sync until interrupted.
    Watch {
        /// Defaults to `watcher.docs_path`.
        path: Option<PathBuf>,
    },
    /// Print collection statistics.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.validate()?;

    match cli.command {
        Command::Index { path } => {
            let path = path.unwrap_or_else(|| config.watcher.docs_path.clone());
            run_index(&config, &path).await
        }
        Command::Search {
            query,
            limit,
            threshold,
        } => run_search(&config, &query, limit, threshold).await,
        Command::Delete { file_name } => {
            let indexer = build_indexer(&config)?;
            // Shared chunks can only be handed to their other files once those are known.
            indexer.prepare().await?;
            let ack = indexer.delete_by_filename(&file_name).await?;
            print_json(&ack)
        }
        // Neither needs an embedding key, so both go to the store directly.
        Command::Files => {
            let store = build_store(&config)?;
            let files = store
                .indexed_files()
                .await
                .with_context(|| format!("failed to list collection {}", store.collection()))?;
            print_json(&files)
        }
        Command::Clear { yes } => {
            anyhow::ensure!(yes, "refusing to clear the collection without --yes");
            let store = build_store(&config)?;
            let points_removed = store.clear().await?;
            print_json(&ClearAck {
                collection: store.collection().to_owned(),
                points_removed,
            })
        }
        Command::Watch { path } => {
            let path = path.unwrap_or_else(|| config.watcher.docs_path.clone());
            run_watch(&config, &path).await
        }
        Command::Status => {
            let store = build_store(&config)?;
            let info = store
                .info()
                .await
                .with_context(|| format!("failed to read collection {}", store.collection()))?;
            print_json(&info)
        }
    }
}

fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Ok(path) = std::env::var("TECHNICIA_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

fn build_store(config: &Config) -> anyhow::Result<DocumentStore> {
    let ops = QdrantOps::new(&config.store.qdrant_url)
        .with_context(|| format!("invalid Qdrant URL {}", config.store.qdrant_url))?;
    Ok(DocumentStore::new(
        Arc::new(ops),
        config.store.collection.clone(),
        config.embedding.dimensions as u64,
        Distance::Cosine,
    ))
}

fn build_gateway(config: &Config) -> anyhow::Result<EmbeddingGateway<VoyageProvider>> {
    let Some(key) = &config.secrets.voyage_api_key else {
        bail!("TECHNICIA_VOYAGE_API_KEY is not set");
    };
    let provider = VoyageProvider::new(
        &config.embedding.base_url,
        key.expose().to_owned(),
        config.embedding.model.clone(),
        Duration::from_secs(config.embedding.timeout_secs),
    )
    .context("failed to create embedding provider")?
    .with_max_retries(config.embedding.max_retries);
    Ok(EmbeddingGateway::new(Arc::new(provider), config.embed()))
}

fn build_indexer(config: &Config) -> anyhow::Result<DocumentIndexer<VoyageProvider>> {
    let splitter = TextSplitter::try_new(config.splitter())?;
    Ok(DocumentIndexer::new(
        Box::new(config.pdf_loader()),
        splitter,
        build_gateway(config)?,
        build_store(config)?,
        Arc::new(DedupIndex::new()),
    ))
}

async fn run_index(config: &Config, path: &Path) -> anyhow::Result<()> {
    let indexer = build_indexer(config)?;
    indexer
        .prepare()
        .await
        .context("failed to prepare the vector collection")?;

    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot access {}", path.display()))?;
    if meta.is_dir() {
        let report = indexer.index_directory(path).await?;
        tracing::info!(
            scanned = report.files_scanned,
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            failed = report.files_failed,
            chunks = report.chunks_processed,
            "directory indexed"
        );
        print_json(&report)
    } else {
        let outcome = indexer.index_document(path).await;
        print_json(&outcome)
    }
}

async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<u64>,
    threshold: Option<f32>,
) -> anyhow::Result<()> {
    let Some(key) = &config.secrets.anthropic_api_key else {
        bail!("TECHNICIA_ANTHROPIC_API_KEY is not set");
    };
    let answerer = ClaudeProvider::new(
        key.expose().to_owned(),
        config.llm.model.clone(),
        config.llm.max_tokens,
        Duration::from_secs(config.llm.timeout_secs),
    )
    .context("failed to create answer provider")?;

    let retriever = Retriever::new(
        build_gateway(config)?,
        build_store(config)?,
        Arc::new(answerer),
        config.retrieval(),
    );
    let limit = limit.unwrap_or(retriever.config().limit);
    let response = retriever.search_or_fallback(query, limit, threshold).await;
    print_json(&response)
}

async fn run_watch(config: &Config, path: &Path) -> anyhow::Result<()> {
    let indexer = Arc::new(build_indexer(config)?);
    indexer
        .prepare()
        .await
        .context("failed to prepare the vector collection")?;

    let watcher = IndexWatcher::start(path, Arc::clone(&indexer), &config.watcher())
        .with_context(|| format!("failed to watch {}", path.display()))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("received shutdown signal");
    watcher.shutdown();
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_accepts_negative_threshold() {
        let cli = Cli::try_parse_from(["technicia", "search", "torque?", "--threshold", "-1"])
            .unwrap();
        match cli.command {
            Command::Search { threshold, .. } => assert_eq!(threshold, Some(-1.0)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn clear_takes_a_confirmation_flag() {
        let cli = Cli::try_parse_from(["technicia", "clear", "--yes"]).unwrap();
        assert!(matches!(cli.command, Command::Clear { yes: true }));
        let cli = Cli::try_parse_from(["technicia", "clear"]).unwrap();
        assert!(matches!(cli.command, Command::Clear { yes: false }));
        let cli = Cli::try_parse_from(["technicia", "files"]).unwrap();
        assert!(matches!(cli.command, Command::Files));
    }

    #[test]
    fn explicit_config_flag_wins() {
        let path = resolve_config_path(Some(PathBuf::from("custom.toml")));
        assert_eq!(path, PathBuf::from("custom.toml"));
    }
}

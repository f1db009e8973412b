use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use technicia_index::{RetrievalConfig, WatcherConfig};
use technicia_memory::EmbedConfig;
use technicia_memory::document::{DEFAULT_MAX_FILE_SIZE, PdfLoader, SplitterConfig};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: technicia_llm::voyage::DEFAULT_BASE_URL.into(),
            model: "voyage-2".into(),
            dimensions: 1024,
            batch_size: 20,
            batch_delay_ms: 200,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-opus-20240229".into(),
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub qdrant_url: String,
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6334".into(),
            collection: "technicia".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let defaults = SplitterConfig::default();
        Self {
            chunk_size: defaults.chunk_size,
            chunk_overlap: defaults.chunk_overlap,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub limit: u64,
    pub score_threshold: f32,
    pub max_context_chars: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        let defaults = RetrievalConfig::default();
        Self {
            limit: defaults.limit,
            score_threshold: defaults.score_threshold,
            max_context_chars: defaults.max_context_chars,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WatcherSection {
    pub docs_path: PathBuf,
    pub settle_delay_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            docs_path: PathBuf::from("docs"),
            settle_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub max_file_size: u64,
    pub read_retries: u32,
    pub read_backoff_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            read_retries: 3,
            read_backoff_ms: 250,
        }
    }
}

/// API keys, read from the environment only.
#[derive(Debug, Default)]
pub struct Secrets {
    pub voyage_api_key: Option<Secret>,
    pub anthropic_api_key: Option<Secret>,
}

pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TECHNICIA_VOYAGE_API_KEY") {
            self.secrets.voyage_api_key = Some(Secret::new(v));
        }
        if let Ok(v) = std::env::var("TECHNICIA_ANTHROPIC_API_KEY") {
            self.secrets.anthropic_api_key = Some(Secret::new(v));
        }
        if let Ok(v) = std::env::var("TECHNICIA_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("TECHNICIA_EMBEDDING_DIMENSIONS") {
            match v.parse::<usize>() {
                Ok(dims) => self.embedding.dimensions = dims,
                Err(_) => tracing::warn!("ignoring invalid TECHNICIA_EMBEDDING_DIMENSIONS value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("TECHNICIA_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("TECHNICIA_QDRANT_URL") {
            self.store.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("TECHNICIA_COLLECTION") {
            self.store.collection = v;
        }
        if let Ok(v) = std::env::var("TECHNICIA_DOCS_PATH") {
            self.watcher.docs_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TECHNICIA_CHUNK_SIZE")
            && let Ok(size) = v.parse::<usize>()
        {
            self.chunking.chunk_size = size;
        }
        if let Ok(v) = std::env::var("TECHNICIA_CHUNK_OVERLAP")
            && let Ok(overlap) = v.parse::<usize>()
        {
            self.chunking.chunk_overlap = overlap;
        }
        if let Ok(v) = std::env::var("TECHNICIA_SCORE_THRESHOLD")
            && let Ok(threshold) = v.parse::<f32>()
        {
            self.retrieval.score_threshold = threshold;
        }
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be greater than 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }
        if self.embedding.dimensions == 0 {
            bail!("embedding.dimensions must be greater than 0");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.score_threshold) {
            bail!(
                "retrieval.score_threshold must be within [-1, 1], got {}",
                self.retrieval.score_threshold
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn splitter(&self) -> SplitterConfig {
        SplitterConfig {
            chunk_size: self.chunking.chunk_size,
            chunk_overlap: self.chunking.chunk_overlap,
        }
    }

    /// Retries here cover timeouts and transport errors; HTTP-level retries live in the provider.
    #[must_use]
    pub fn embed(&self) -> EmbedConfig {
        EmbedConfig {
            batch_size: self.embedding.batch_size,
            batch_delay: Duration::from_millis(self.embedding.batch_delay_ms),
            dimensions: self.embedding.dimensions,
            timeout: Duration::from_secs(self.embedding.timeout_secs),
            max_retries: 1,
            ..EmbedConfig::default()
        }
    }

    #[must_use]
    pub fn retrieval(&self) -> RetrievalConfig {
        RetrievalConfig {
            limit: self.retrieval.limit,
            score_threshold: self.retrieval.score_threshold,
            max_context_chars: self.retrieval.max_context_chars,
            answer_timeout: Duration::from_secs(self.llm.timeout_secs),
        }
    }

    #[must_use]
    pub fn watcher(&self) -> WatcherConfig {
        WatcherConfig {
            settle_delay: Duration::from_millis(self.watcher.settle_delay_ms),
            ..WatcherConfig::default()
        }
    }

    #[must_use]
    pub fn pdf_loader(&self) -> PdfLoader {
        PdfLoader {
            max_file_size: self.loader.max_file_size,
            read_retries: self.loader.read_retries,
            read_backoff: Duration::from_millis(self.loader.read_backoff_ms),
        }
    }
}

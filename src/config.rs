use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_CATALOG_URL: &str = "https://photoslibrary.googleapis.com";
const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_AUTH_RETRIES: u8 = 1;

const DEFAULT_FETCH_WORKERS: usize = 8;
const DEFAULT_BATCH_SIZE: usize = 25;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_RETRIES: u8 = 2;
const MAX_FETCH_RETRIES: u8 = 10;

const DEFAULT_CAPTION_ENDPOINT: &str = "http://127.0.0.1:5000/caption";
const DEFAULT_CAPTION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CAPTION_MAX_LENGTH: u32 = 16;
const DEFAULT_CAPTION_NUM_BEAMS: u32 = 4;
const DEFAULT_CAPTION_MAX_DIMENSION: u32 = 384;

/// Default semantic search model
const DEFAULT_SEMANTIC_MODEL: &str = "bge-small-en-v1.5";
const DEFAULT_SEARCH_LIMIT: usize = 5;
const DEFAULT_EMBED_BATCH_SIZE: usize = 64;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Remote album the ingest walks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,

    /// Album to enumerate. Whole library when unset.
    #[serde(default)]
    pub album_id: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// File holding the bearer token. Re-read whenever the catalog
    /// rejects the current one.
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// How many times a page request is re-issued after a credential refresh
    #[serde(default = "default_auth_retries")]
    pub auth_retries: u8,

    /// Appended to every item url before download (e.g. "=d")
    #[serde(default)]
    pub download_suffix: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            album_id: None,
            page_size: DEFAULT_PAGE_SIZE,
            token_file: None,
            auth_retries: DEFAULT_AUTH_RETRIES,
            download_suffix: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent downloads
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    /// Images per captioning call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Retries for transport errors and 5xx responses
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_workers: DEFAULT_FETCH_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            fetch_retries: DEFAULT_FETCH_RETRIES,
        }
    }
}

/// Inference service that turns images into captions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptioningConfig {
    #[serde(default = "default_caption_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_caption_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum caption length in tokens
    #[serde(default = "default_caption_max_length")]
    pub max_length: u32,

    #[serde(default = "default_caption_num_beams")]
    pub num_beams: u32,

    /// Images are downscaled to this size before upload
    #[serde(default = "default_caption_max_dimension")]
    pub max_dimension: u32,
}

impl Default for CaptioningConfig {
    fn default() -> Self {
        Self {
            endpoint: default_caption_endpoint(),
            api_key: None,
            timeout_secs: DEFAULT_CAPTION_TIMEOUT_SECS,
            max_length: DEFAULT_CAPTION_MAX_LENGTH,
            num_beams: DEFAULT_CAPTION_NUM_BEAMS,
            max_dimension: DEFAULT_CAPTION_MAX_DIMENSION,
        }
    }
}

/// Configuration for semantic search functionality
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Results returned when the caller doesn't ask for a specific count
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    /// Captions embedded per model call during `index`
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_SEMANTIC_MODEL.to_string(),
            default_limit: DEFAULT_SEARCH_LIMIT,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Store every cached blob as png
    #[serde(default = "default_true")]
    pub transcode_png: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            transcode_png: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Require `Authorization: Bearer <token>` when set
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth_token: None,
        }
    }
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_auth_retries() -> u8 {
    DEFAULT_AUTH_RETRIES
}

fn default_fetch_workers() -> usize {
    DEFAULT_FETCH_WORKERS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_fetch_retries() -> u8 {
    DEFAULT_FETCH_RETRIES
}

fn default_caption_endpoint() -> String {
    DEFAULT_CAPTION_ENDPOINT.to_string()
}

fn default_caption_timeout_secs() -> u64 {
    DEFAULT_CAPTION_TIMEOUT_SECS
}

fn default_caption_max_length() -> u32 {
    DEFAULT_CAPTION_MAX_LENGTH
}

fn default_caption_num_beams() -> u32 {
    DEFAULT_CAPTION_NUM_BEAMS
}

fn default_caption_max_dimension() -> u32 {
    DEFAULT_CAPTION_MAX_DIMENSION
}

fn default_semantic_model() -> String {
    DEFAULT_SEMANTIC_MODEL.to_string()
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_embed_batch_size() -> usize {
    DEFAULT_EMBED_BATCH_SIZE
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub captioning: CaptioningConfig,
    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.catalog.page_size == 0 {
            bail!("catalog.page_size must be greater than 0");
        }

        if self.pipeline.fetch_workers == 0 {
            bail!("pipeline.fetch_workers must be greater than 0");
        }

        if self.pipeline.fetch_workers > 256 {
            bail!(
                "pipeline.fetch_workers cannot exceed 256, got {}",
                self.pipeline.fetch_workers
            );
        }

        if self.pipeline.fetch_retries > MAX_FETCH_RETRIES {
            bail!(
                "pipeline.fetch_retries cannot exceed {MAX_FETCH_RETRIES}, got {}",
                self.pipeline.fetch_retries
            );
        }

        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be greater than 0");
        }

        if self.captioning.max_dimension == 0 {
            bail!("captioning.max_dimension must be greater than 0");
        }

        let sem = &self.semantic_search;
        if sem.default_limit == 0 {
            bail!("semantic_search.default_limit must be greater than 0");
        }

        if sem.embed_batch_size == 0 {
            bail!("semantic_search.embed_batch_size must be greater than 0");
        }

        if let Some(token) = &self.server.auth_token {
            if token.trim().is_empty() {
                bail!("server.auth_token must not be blank; remove it to disable auth");
            }
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to open {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            log::info!("writing default config to {}", base_path.display());
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

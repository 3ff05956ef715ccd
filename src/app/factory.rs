use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use homedir::my_home;

use crate::{
    app::AppContext,
    cache::MediaCache,
    catalog::{CatalogApi, CredentialProvider, HttpCatalog, StaticCredential, TokenFile},
    config::{CatalogConfig, Config},
    ledger::Ledger,
    pipeline::{Captioner, HttpCaptioner, HttpFetcher},
    semantic::TABLE_FILE_NAME,
    storage,
};

const BASE_PATH_ENV: &str = "STICKME_BASE_PATH";
const CATALOG_TOKEN_ENV: &str = "STICKME_CATALOG_TOKEN";

/// How a context may touch the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAccess {
    /// Never writes. Safe next to a running ingest.
    ReadOnly,
    /// Appends and repairs a torn tail. Hold the base dir [`FileLock`] first.
    ///
    /// [`FileLock`]: crate::lock::FileLock
    Append,
}

/// Builds the application from its on-disk layout.
pub struct AppFactory;

impl AppFactory {
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        Ok(AppPaths::new(base_path))
    }

    fn get_base_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(BASE_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .context("could not determine home directory")?
            .context("home directory path is empty")?;
        Ok(home.join(".local/share/stickme"))
    }

    /// Loads config, opens the ledger and wires the cache. The embedding
    /// model is loaded later, on first search.
    pub fn create_context(paths: AppPaths, access: LedgerAccess) -> Result<AppContext> {
        let config = Config::load_with(&paths.base_path)?;

        let ledger_path = paths.ledger();
        let ledger = match access {
            LedgerAccess::ReadOnly => Ledger::open_read_only(&ledger_path),
            LedgerAccess::Append => Ledger::open(&ledger_path),
        }
        .with_context(|| format!("failed to open {}", ledger_path.display()))?;
        let ledger = Arc::new(ledger);
        log::debug!("ledger has {} records", ledger.len());

        let fetcher = Arc::new(
            HttpFetcher::new(
                Duration::from_secs(config.pipeline.fetch_timeout_secs),
                config.pipeline.fetch_retries,
            )
            .context("failed to build http client")?,
        );

        let store = Arc::new(storage::BackendLocal::new(paths.cache_dir())?);
        let cache = Arc::new(MediaCache::new(
            store,
            ledger.clone(),
            fetcher.clone(),
            config.cache.transcode_png,
        ));

        Ok(AppContext::new(config, paths, ledger, fetcher, cache))
    }

    pub fn create_catalog(config: &CatalogConfig, timeout: Duration) -> Result<Arc<dyn CatalogApi>> {
        Ok(Arc::new(HttpCatalog::new(config, timeout)?))
    }

    /// Token file from config wins, then the environment.
    pub fn create_credentials(config: &CatalogConfig) -> Result<Arc<dyn CredentialProvider>> {
        if let Some(path) = &config.token_file {
            log::debug!("reading catalog token from {}", path.display());
            return Ok(Arc::new(TokenFile::new(path)));
        }

        let token = std::env::var(CATALOG_TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .with_context(|| {
                format!("no catalog credential: set catalog.token_file in config.yaml or {CATALOG_TOKEN_ENV}")
            })?;
        Ok(Arc::new(StaticCredential::new(token)))
    }

    pub fn create_captioner(config: &Config) -> Result<Arc<dyn Captioner>> {
        Ok(Arc::new(
            HttpCaptioner::new(&config.captioning).context("failed to build captioning client")?,
        ))
    }
}

/// File layout under the base directory.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base_path
    }

    pub fn ledger(&self) -> PathBuf {
        self.base_path.join("annotations.csv")
    }

    pub fn table(&self) -> PathBuf {
        self.base_path.join(TABLE_FILE_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_path.join("cache")
    }
}

use std::sync::{Arc, Mutex};

use crate::{
    app::{errors::AppError, factory::AppPaths},
    cache::MediaCache,
    config::Config,
    ledger::Ledger,
    pipeline::MediaFetcher,
    semantic::{EmbeddingModel, SearchService, TableStorage},
};

/// Everything a command or request handler needs, built once at startup
/// and passed down explicitly.
pub struct AppContext {
    config: Config,
    paths: AppPaths,
    ledger: Arc<Ledger>,
    fetcher: Arc<dyn MediaFetcher>,
    cache: Arc<MediaCache>,
    /// Loading the embedding model is slow, so it waits for the first
    /// command that searches or indexes.
    search: Mutex<Option<Arc<SearchService>>>,
}

impl AppContext {
    pub fn new(
        config: Config,
        paths: AppPaths,
        ledger: Arc<Ledger>,
        fetcher: Arc<dyn MediaFetcher>,
        cache: Arc<MediaCache>,
    ) -> Self {
        Self {
            config,
            paths,
            ledger,
            fetcher,
            cache,
            search: Mutex::new(None),
        }
    }

    /// Uses a prepared search service instead of loading the configured
    /// embedding model.
    #[cfg(test)]
    pub fn with_search_service(self, service: Arc<SearchService>) -> Self {
        Self {
            search: Mutex::new(Some(service)),
            ..self
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn fetcher(&self) -> &Arc<dyn MediaFetcher> {
        &self.fetcher
    }

    pub fn cache(&self) -> &Arc<MediaCache> {
        &self.cache
    }

    /// Search service with the persisted table loaded, created on first call.
    pub fn search_service(&self) -> Result<Arc<SearchService>, AppError> {
        let mut guard = self
            .search
            .lock()
            .map_err(|e| AppError::Other(anyhow::anyhow!("search service lock poisoned: {e}")))?;

        if let Some(service) = guard.as_ref() {
            return Ok(service.clone());
        }

        let semantic = &self.config.semantic_search;
        log::info!("loading embedding model '{}'", semantic.model);
        let embedder = EmbeddingModel::new(&semantic.model, self.paths.base())?;

        let service = Arc::new(SearchService::new(
            Arc::new(embedder),
            TableStorage::new(self.paths.table()),
            semantic.embed_batch_size,
        ));
        service.reload(&self.ledger)?;

        *guard = Some(service.clone());
        Ok(service)
    }

    /// Search service only if something already created it
    pub fn loaded_search_service(&self) -> Option<Arc<SearchService>> {
        self.search.lock().ok().and_then(|guard| guard.clone())
    }
}

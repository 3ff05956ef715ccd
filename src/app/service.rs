//! Top-level operations behind the CLI commands and HTTP routes.

use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

use indicatif::ProgressBar;
use serde::Serialize;

use crate::{
    app::{errors::AppError, AppContext},
    catalog::{CatalogApi, CatalogError, CredentialProvider, Enumerator},
    images,
    pipeline::{Captioner, Pipeline, RunStats},
};

/// Outcome of one `ingest` run.
#[derive(Debug)]
pub struct IngestReport {
    pub stats: RunStats,
    pub pages: usize,
    /// Set when the catalog walk ended early; everything before it is
    /// already in the ledger.
    pub catalog_error: Option<CatalogError>,
}

/// One search result as served to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    /// Path of the cached image for this record
    pub img: String,
    pub caption: String,
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Health {
    pub records: usize,
    pub indexed: usize,
}

/// Route for an item's image. Ids are opaque, so they are percent-encoded
/// to stay a single path segment.
pub fn image_path(id: &str) -> String {
    format!("/image/{}", urlencoding::encode(id))
}

impl AppContext {
    /// Walks the catalog and captions every item the ledger does not have.
    ///
    /// Pages are pulled lazily while the pipeline runs, so batches span
    /// page boundaries.
    pub fn ingest(
        &self,
        catalog: Arc<dyn CatalogApi>,
        credentials: Arc<dyn CredentialProvider>,
        captioner: Arc<dyn Captioner>,
        stop: Arc<AtomicBool>,
        progress: Option<ProgressBar>,
    ) -> Result<IngestReport, AppError> {
        let catalog_config = &self.config().catalog;
        let pipeline_config = &self.config().pipeline;

        let mut enumerator = Enumerator::new(
            catalog,
            credentials,
            catalog_config.page_size,
            catalog_config.auth_retries,
        );

        let mut pipeline = Pipeline::new(
            self.fetcher().clone(),
            captioner,
            self.ledger().clone(),
            pipeline_config.fetch_workers,
            pipeline_config.batch_size,
        )
        .with_stop_flag(stop);
        if let Some(progress) = progress {
            pipeline = pipeline.with_progress(progress);
        }

        let mut catalog_error = None;
        let items = enumerator
            .by_ref()
            .map_while(|page| match page {
                Ok(items) => Some(items),
                Err(err) => {
                    catalog_error = Some(err);
                    None
                }
            })
            .flatten();

        let stats = pipeline.process(items)?;

        if let Some(err) = &catalog_error {
            log::error!("catalog walk stopped: {err}");
        }

        Ok(IngestReport {
            stats,
            pages: enumerator.pages_fetched(),
            catalog_error,
        })
    }

    /// Re-embeds every caption and replaces the persisted table.
    pub fn rebuild_index(&self) -> Result<usize, AppError> {
        let service = self.search_service()?;
        Ok(service.rebuild(self.ledger())?)
    }

    /// `k` falls back to `semantic_search.default_limit`.
    pub fn search(&self, query: &str, k: Option<usize>) -> Result<Vec<SearchHit>, AppError> {
        if query.trim().is_empty() {
            return Err(AppError::BadRequest("query must not be empty".to_string()));
        }
        let k = k.unwrap_or(self.config().semantic_search.default_limit);

        let service = self.search_service()?;
        let hits = service
            .search(query, k)?
            .into_iter()
            .map(|scored| SearchHit {
                img: image_path(&scored.record.id),
                caption: scored.record.caption,
                id: scored.record.id,
                score: scored.score,
            })
            .collect();
        Ok(hits)
    }

    pub fn image(&self, id: &str) -> Result<Vec<u8>, AppError> {
        Ok(self.cache().get_image_bytes(id)?)
    }

    /// Captions local files in one batch. Handy for checking the model
    /// endpoint without touching the catalog or the ledger.
    pub fn caption_files(
        &self,
        captioner: &dyn Captioner,
        files: &[PathBuf],
    ) -> Result<Vec<(PathBuf, String)>, AppError> {
        let imgs = files
            .iter()
            .map(|path| read_rgb(path))
            .collect::<Result<Vec<_>, _>>()?;

        let captions = captioner.caption(&imgs)?;
        Ok(files.iter().cloned().zip(captions).collect())
    }

    pub fn health(&self) -> Health {
        Health {
            records: self.ledger().len(),
            indexed: self
                .loaded_search_service()
                .map(|service| service.indexed())
                .unwrap_or(0),
        }
    }
}

fn read_rgb(path: &Path) -> Result<image::RgbImage, AppError> {
    let bytes = std::fs::read(path)?;
    images::decode_rgb(&bytes)
        .map_err(|err| AppError::BadRequest(format!("{}: {err:#}", path.display())))
}

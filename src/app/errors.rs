use crate::{
    cache::CacheError,
    catalog::CatalogError,
    ledger::LedgerError,
    pipeline::{FetchError, InferenceError, PipelineError},
    semantic::{EmbeddingError, SearchError},
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("upstream fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("captioning failed: {0}")]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("search failed: {0}")]
    Search(#[from] SearchError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(id) => AppError::NotFound(id),
            CacheError::Fetch(err) => AppError::Fetch(err),
            CacheError::Io(err) => AppError::IO(err),
        }
    }
}

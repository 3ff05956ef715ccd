//! Text embedding model.
//!
//! [`EmbeddingModel`] wraps fastembed and downloads its weights into
//! `<base>/models` on first use. Everything else talks to the
//! [`Embedder`] trait so tests can swap in a fixed-vector model.

use std::{path::Path, sync::Mutex};

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("unknown embedding model {0:?}, expected one of: {models}", models = SUPPORTED_MODELS.join(", "))]
    InvalidModel(String),
}

const SUPPORTED_MODELS: &[&str] = &[
    "all-MiniLM-L6-v2",
    "bge-small-en-v1.5",
    "bge-base-en-v1.5",
    "bge-large-en-v1.5",
];

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// One vector per text, same order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    /// Stable identifier written into the table file so a table built by
    /// one model is never searched with another.
    fn model_id_hash(&self) -> [u8; 32];
}

pub fn model_id_hash(name: &str) -> [u8; 32] {
    Sha256::digest(name.as_bytes()).into()
}

/// fastembed's `embed` wants `&mut self`, hence the mutex.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    pub fn new(model_name: &str, base_path: &Path) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        let models_dir = base_path.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("failed to create {}: {e}", models_dir.display()))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model =
            TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = model
            .embed(vec!["probe"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("failed to probe dimensions: {e}")))?
            .first()
            .map(Vec::len)
            .ok_or_else(|| EmbeddingError::InitFailed("model returned no embedding".to_string()))?;

        log::debug!("loaded embedding model {model_name} ({dimensions} dims)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

impl Embedder for EmbeddingModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("no embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("model lock poisoned: {e}")))?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(&self.model_name)
    }
}

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    use fastembed::EmbeddingModel as M;

    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(M::AllMiniLML6V2),
        "all-minilm-l6-v2-q" => Ok(M::AllMiniLML6V2Q),
        "bge-small-en-v1.5" => Ok(M::BGESmallENV15),
        "bge-small-en-v1.5-q" => Ok(M::BGESmallENV15Q),
        "bge-base-en-v1.5" => Ok(M::BGEBaseENV15),
        "bge-base-en-v1.5-q" => Ok(M::BGEBaseENV15Q),
        "bge-large-en-v1.5" => Ok(M::BGELargeENV15),
        "bge-large-en-v1.5-q" => Ok(M::BGELargeENV15Q),
        _ => Err(EmbeddingError::InvalidModel(name.to_string())),
    }
}

//! Caption search.
//!
//! - `embeddings`: text embedding model (fastembed) behind the `Embedder` trait
//! - `index`: positional embedding table and cosine ranking
//! - `storage`: embeddings.bin persistence
//! - `service`: snapshot holder used by the CLI and the web server

pub mod embeddings;
mod index;
mod service;
mod storage;

pub use embeddings::{EmbeddingError, EmbeddingModel};
pub use service::{SearchError, SearchService};
pub use storage::{TableStorage, TABLE_FILE_NAME};

#[cfg(test)]
pub(crate) use index::tests::FixedEmbedder;

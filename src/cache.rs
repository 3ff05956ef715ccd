//! Read-through cache of original media, keyed by annotation id.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{
    images,
    ledger::Ledger,
    pipeline::{FetchError, MediaFetcher},
    storage::StorageManager,
};

const MAX_PLAIN_KEY_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown id: {0}")]
    NotFound(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct MediaCache {
    store: Arc<dyn StorageManager>,
    ledger: Arc<Ledger>,
    fetcher: Arc<dyn MediaFetcher>,
    transcode_png: bool,
}

impl MediaCache {
    pub fn new(
        store: Arc<dyn StorageManager>,
        ledger: Arc<Ledger>,
        fetcher: Arc<dyn MediaFetcher>,
        transcode_png: bool,
    ) -> Self {
        Self {
            store,
            ledger,
            fetcher,
            transcode_png,
        }
    }

    /// Returns the cached blob, or downloads it from the record's source
    /// url and caches it first.
    ///
    /// Two concurrent misses for the same id may both download; the writes
    /// are atomic so the last one simply wins.
    pub fn get_image_bytes(&self, id: &str) -> Result<Vec<u8>, CacheError> {
        let key = cache_key(id);

        if self.store.exists(&key) {
            log::debug!("cache hit for {id}");
            return Ok(self.store.read(&key)?);
        }

        let record = self
            .ledger
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;

        log::debug!("cache miss for {id}, fetching {}", record.source_url);
        let bytes = self.fetcher.fetch(&record.source_url)?;
        let bytes = if self.transcode_png {
            match images::to_png(bytes.clone()) {
                Ok(png) => png,
                Err(err) => {
                    log::warn!("caching {id} untranscoded: {err:#}");
                    bytes
                }
            }
        } else {
            bytes
        };

        self.store.write(&key, &bytes)?;
        Ok(bytes)
    }

    #[cfg(test)]
    pub fn is_cached(&self, id: &str) -> bool {
        self.store.exists(&cache_key(id))
    }
}

/// File name a given id is cached under. Plain ids map to themselves,
/// anything that could escape the cache directory is hashed.
pub fn cache_key(id: &str) -> String {
    let plain = !id.is_empty()
        && id.len() <= MAX_PLAIN_KEY_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if plain {
        id.to_string()
    } else {
        Sha256::digest(id.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

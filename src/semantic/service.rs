//! Query-side view of the annotation store.
//!
//! Queries run against an immutable [`Snapshot`] of (records, table). A
//! reload or rebuild prepares a complete new snapshot off to the side and
//! swaps it in under a write lock, so a query sees either the old snapshot
//! or the new one.

use std::sync::{Arc, RwLock};

use super::{
    embeddings::Embedder,
    index::{self, EmbeddingTable, IndexError, ScoredRecord},
    storage::{TableStorage, TableStorageError},
};
use crate::ledger::{AnnotationRecord, Ledger};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] TableStorageError),

    #[error("search snapshot lock poisoned")]
    Poisoned,
}

/// Records and their embeddings, row-aligned.
#[derive(Debug)]
pub struct Snapshot {
    records: Vec<AnnotationRecord>,
    table: EmbeddingTable,
}

impl Snapshot {
    fn new(mut records: Vec<AnnotationRecord>, table: EmbeddingTable) -> Result<Self, IndexError> {
        if table.len() > records.len() {
            return Err(IndexError::Misaligned {
                rows: table.len(),
                records: records.len(),
            });
        }
        if records.len() > table.len() {
            log::warn!(
                "{} annotations are not indexed yet, run `stickme index` to include them",
                records.len() - table.len()
            );
            records.truncate(table.len());
        }
        Ok(Self { records, table })
    }

    #[cfg(test)]
    fn records(&self) -> &[AnnotationRecord] {
        &self.records
    }

    #[cfg(test)]
    fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    fn len(&self) -> usize {
        self.table.len()
    }
}

pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    storage: TableStorage,
    batch_size: usize,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SearchService {
    /// Starts with an empty snapshot; call [`reload`](Self::reload) or
    /// [`rebuild`](Self::rebuild) to populate it.
    pub fn new(embedder: Arc<dyn Embedder>, storage: TableStorage, batch_size: usize) -> Self {
        let empty = Snapshot {
            records: vec![],
            table: EmbeddingTable::new(embedder.dimensions()),
        };
        Self {
            embedder,
            storage,
            batch_size,
            snapshot: RwLock::new(Arc::new(empty)),
        }
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>, SearchError> {
        self.snapshot
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| SearchError::Poisoned)
    }

    fn swap(&self, snapshot: Snapshot) -> Result<usize, SearchError> {
        let rows = snapshot.len();
        let mut guard = self.snapshot.write().map_err(|_| SearchError::Poisoned)?;
        *guard = Arc::new(snapshot);
        Ok(rows)
    }

    /// Pairs the persisted table with the current ledger contents.
    ///
    /// A missing table, or one written by another model, loads as empty and
    /// asks for a rebuild. Returns the number of searchable rows.
    pub fn reload(&self, ledger: &Ledger) -> Result<usize, SearchError> {
        let dimensions = self.embedder.dimensions();

        let table = if self.storage.exists() {
            match self
                .storage
                .load(&self.embedder.model_id_hash(), dimensions)
            {
                Ok(table) => table,
                Err(
                    err @ (TableStorageError::ModelMismatch
                    | TableStorageError::DimensionMismatch { .. }
                    | TableStorageError::VersionMismatch(..)),
                ) => {
                    log::warn!("ignoring {}: {err}, run `stickme index`", self.storage.path().display());
                    EmbeddingTable::new(dimensions)
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            log::info!("no embedding table yet, run `stickme index` to build one");
            EmbeddingTable::new(dimensions)
        };

        let rows = self.swap(Snapshot::new(ledger.all(), table)?)?;
        log::info!("search snapshot loaded with {rows} rows");
        Ok(rows)
    }

    /// Embeds every ledger caption, persists the table and swaps it in.
    pub fn rebuild(&self, ledger: &Ledger) -> Result<usize, SearchError> {
        let records = ledger.all();
        log::info!("embedding {} captions", records.len());

        let table = index::build(&records, self.embedder.as_ref(), self.batch_size)?;
        self.storage.save(&table, &self.embedder.model_id_hash())?;

        let rows = self.swap(Snapshot::new(records, table)?)?;
        log::info!("search index rebuilt with {rows} rows");
        Ok(rows)
    }

    pub fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredRecord>, SearchError> {
        let snapshot = self.snapshot()?;
        Ok(index::search(
            query,
            self.embedder.as_ref(),
            &snapshot.table,
            &snapshot.records,
            k,
        )?)
    }

    pub fn indexed(&self) -> usize {
        self.snapshot().map(|s| s.len()).unwrap_or(0)
    }
}

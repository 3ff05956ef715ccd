//! Positional embedding table and brute-force cosine search.
//!
//! Row `i` of an [`EmbeddingTable`] is the embedding of `records[i].caption`.
//! There are no ids in the table; alignment with the ledger order is the
//! only link between the two.


use super::embeddings::{Embedder, EmbeddingError};
use crate::ledger::AnnotationRecord;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot search with a zero-norm query vector")]
    ZeroNormVector,

    #[error("embedding table has {rows} rows but only {records} records")]
    Misaligned { rows: usize, records: usize },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Row-major matrix of caption embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    dimensions: usize,
    data: Vec<f32>,
}

impl EmbeddingTable {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dimensions: usize, rows: usize) -> Self {
        Self {
            dimensions,
            data: Vec::with_capacity(dimensions * rows),
        }
    }

    /// Builds a table from a flat value buffer. `data.len()` must be a
    /// multiple of `dimensions`.
    pub fn from_raw(dimensions: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dimensions == 0 || data.len() % dimensions != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                got: data.len(),
            });
        }
        Ok(Self { dimensions, data })
    }

    pub fn push(&mut self, row: &[f32]) -> Result<(), IndexError> {
        if row.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        self.rows().nth(i)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }

    pub(crate) fn raw(&self) -> &[f32] {
        &self.data
    }
}

/// A search hit: the record plus its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: AnnotationRecord,
    pub score: f32,
}

/// Embeds every caption, in record order, `batch_size` captions per model
/// call.
pub fn build(
    records: &[AnnotationRecord],
    embedder: &dyn Embedder,
    batch_size: usize,
) -> Result<EmbeddingTable, IndexError> {
    let dimensions = embedder.dimensions();
    let mut table = EmbeddingTable::with_capacity(dimensions, records.len());

    for chunk in records.chunks(batch_size.max(1)) {
        let captions: Vec<String> = chunk.iter().map(|r| r.caption.clone()).collect();
        let vectors = embedder.embed_batch(&captions)?;
        if vectors.len() != chunk.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                chunk.len(),
                vectors.len()
            ))
            .into());
        }
        for vector in &vectors {
            table.push(vector)?;
        }
        log::debug!("embedded {}/{} captions", table.len(), records.len());
    }

    Ok(table)
}

/// Ranks records by cosine similarity of their caption embedding to the
/// lowercased query.
///
/// Ties keep the lower row first. `records` may be longer than the table
/// (rows appended after the last build are not searchable yet) but never
/// shorter.
pub fn search(
    query: &str,
    embedder: &dyn Embedder,
    table: &EmbeddingTable,
    records: &[AnnotationRecord],
    k: usize,
) -> Result<Vec<ScoredRecord>, IndexError> {
    if table.len() > records.len() {
        return Err(IndexError::Misaligned {
            rows: table.len(),
            records: records.len(),
        });
    }
    if table.is_empty() || k == 0 {
        return Ok(vec![]);
    }

    let query = embedder.embed(&query.to_lowercase())?;
    rank(&query, table, records, k)
}

/// Scores every row against an already embedded query.
pub fn rank(
    query: &[f32],
    table: &EmbeddingTable,
    records: &[AnnotationRecord],
    k: usize,
) -> Result<Vec<ScoredRecord>, IndexError> {
    if query.len() != table.dimensions() {
        return Err(IndexError::DimensionMismatch {
            expected: table.dimensions(),
            got: query.len(),
        });
    }
    let query_norm = l2_norm(query);
    if query_norm < f32::EPSILON {
        return Err(IndexError::ZeroNormVector);
    }

    let mut scored: Vec<(usize, f32)> = table
        .rows()
        .enumerate()
        .map(|(i, row)| (i, cosine_similarity(query, row, query_norm)))
        .collect();

    // sort_by is stable, equal scores stay in row order
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);

    Ok(scored
        .into_iter()
        .map(|(i, score)| ScoredRecord {
            record: records[i].clone(),
            score,
        })
        .collect())
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = query.iter().zip(target).map(|(a, b)| a * b).sum();
    let score = dot / (query_norm * target_norm);
    // a corrupt row must not outrank real matches
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

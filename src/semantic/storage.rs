//! On-disk embedding table.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 of the model name)
//! - dimensions: u16 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of the 43 bytes before it)
//!
//! Body: `row_count * dimensions` little-endian f32 values, row-major.
//! Rows carry no ids; row `i` belongs to ledger record `i`.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use super::index::EmbeddingTable;

const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 47;

pub const TABLE_FILE_NAME: &str = "embeddings.bin";

#[derive(Debug, thiserror::Error)]
pub enum TableStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid table file: {0}")]
    InvalidFormat(String),

    #[error("table file version {0} is newer than supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("table was built with a different embedding model")]
    ModelMismatch,

    #[error("table header checksum mismatch")]
    ChecksumMismatch,

    #[error("dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Debug, PartialEq)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    row_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(&self.model_id);
        bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[35..43].copy_from_slice(&self.row_count.to_le_bytes());
        let checksum = crc32fast::hash(&bytes[..43]);
        bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, TableStorageError> {
        let version = bytes[0];
        if version > FORMAT_VERSION {
            return Err(TableStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored = u32::from_le_bytes([bytes[43], bytes[44], bytes[45], bytes[46]]);
        if stored != crc32fast::hash(&bytes[..43]) {
            return Err(TableStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[1..33]);

        let mut row_count = [0u8; 8];
        row_count.copy_from_slice(&bytes[35..43]);

        Ok(Self {
            version,
            model_id,
            dimensions: u16::from_le_bytes([bytes[33], bytes[34]]),
            row_count: u64::from_le_bytes(row_count),
        })
    }
}

pub struct TableStorage {
    path: PathBuf,
}

impl TableStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the table, checking it was written by the same model with the
    /// same dimensions.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<EmbeddingTable, TableStorageError> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|_| {
            TableStorageError::InvalidFormat(format!("shorter than the {HEADER_SIZE} byte header"))
        })?;
        let header = Header::decode(&header_bytes)?;

        if header.model_id != *expected_model_id {
            return Err(TableStorageError::ModelMismatch);
        }
        let dimensions = header.dimensions as usize;
        if dimensions != expected_dimensions {
            return Err(TableStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let body_len = header
            .row_count
            .checked_mul(dimensions as u64 * 4)
            .ok_or_else(|| TableStorageError::InvalidFormat("row count overflow".to_string()))?;
        if file_len != HEADER_SIZE as u64 + body_len {
            return Err(TableStorageError::InvalidFormat(format!(
                "expected {} rows of {dimensions} values, file is {file_len} bytes",
                header.row_count
            )));
        }

        let mut body = Vec::with_capacity(body_len as usize);
        reader.read_to_end(&mut body)?;

        let data = body
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        EmbeddingTable::from_raw(dimensions, data)
            .map_err(|e| TableStorageError::InvalidFormat(e.to_string()))
    }

    /// Atomic write: temp file, fsync, rename.
    pub fn save(&self, table: &EmbeddingTable, model_id: &[u8; 32]) -> Result<(), TableStorageError> {
        let dimensions = u16::try_from(table.dimensions()).map_err(|_| {
            TableStorageError::InvalidFormat(format!("{} dimensions do not fit", table.dimensions()))
        })?;

        let temp_path = self.path.with_extension("tmp");
        let result = Self::write_to(&temp_path, table, model_id, dimensions);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        log::debug!("saved {} rows to {}", table.len(), self.path.display());
        Ok(())
    }

    fn write_to(
        path: &Path,
        table: &EmbeddingTable,
        model_id: &[u8; 32],
        dimensions: u16,
    ) -> Result<(), TableStorageError> {
        let mut writer = BufWriter::new(File::create(path)?);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            row_count: table.len() as u64,
        };
        writer.write_all(&header.encode())?;

        for value in table.raw() {
            writer.write_all(&value.to_le_bytes())?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

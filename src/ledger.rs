//! Append-only annotation ledger backed by a CSV file.
//!
//! One row per processed media item. The row position is the stable
//! reference the embedding table is aligned with, so rows are never
//! rewritten or reordered; the only mutation is [`Ledger::append`].

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Mutex, RwLock},
    time::Instant,
};

use serde::{Deserialize, Serialize};

/// A media item as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub source_url: String,
}

/// Caption produced for one media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub id: String,
    pub caption: String,
    pub source_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("record {0:?} has a line break in its id or url")]
    InvalidRecord(String),

    #[error("ledger was opened read-only")]
    ReadOnly,

    #[error("ledger lock poisoned")]
    Poisoned,
}

const CSV_HEADERS: [&str; 3] = ["id", "caption", "url"];

#[derive(Default)]
struct LedgerState {
    records: Vec<AnnotationRecord>,
    rows: HashMap<String, usize>,
}

pub struct Ledger {
    state: RwLock<LedgerState>,
    // None for read-only handles
    file: Option<Mutex<File>>,
}

impl Ledger {
    /// Opens the ledger at `path` for appending, creating it when missing,
    /// and loads every persisted record.
    ///
    /// A torn trailing line is truncated away, so the caller must be the
    /// only writer (see [`crate::lock::FileLock`]).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();

        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new ledger at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        repair_torn_tail(path)?;

        let contents = std::fs::read(path)?;
        let state = load(&contents);
        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Ledger {
            state: RwLock::new(state),
            file: Some(Mutex::new(file)),
        })
    }

    /// Loads the ledger at `path` without ever writing to it.
    ///
    /// A torn trailing line is ignored in memory and left on disk for the
    /// writer that may still be finishing it. A missing file reads as empty.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();

        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!("no ledger at {} yet", path.display());
                Vec::new()
            }
            Err(err) => Err(err)?,
        };

        Ok(Ledger {
            state: RwLock::new(load(&contents[..complete_len(&contents)])),
            file: None,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state
            .read()
            .map(|state| state.rows.contains_key(id))
            .unwrap_or(false)
    }

    /// Durably appends `record`.
    ///
    /// Returns `Ok(false)` without touching the file when the id is already
    /// recorded.
    ///
    /// Line breaks in the caption are folded into spaces so every record
    /// occupies exactly one line on disk.
    pub fn append(&self, record: AnnotationRecord) -> Result<bool, LedgerError> {
        let Some(file) = &self.file else {
            return Err(LedgerError::ReadOnly);
        };
        if has_line_break(&record.id) || has_line_break(&record.source_url) {
            return Err(LedgerError::InvalidRecord(record.id));
        }
        let record = AnnotationRecord {
            caption: one_line(&record.caption),
            ..record
        };

        // held across check and write so the same id can't land twice
        let mut state = self.state.write().map_err(|_| LedgerError::Poisoned)?;
        if state.rows.contains_key(&record.id) {
            return Ok(false);
        }

        let mut csv_wrt = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(vec![]);
        csv_wrt.write_record([&record.id, &record.caption, &record.source_url])?;
        let line = csv_wrt
            .into_inner()
            .map_err(|err| std::io::Error::other(err.to_string()))?;

        {
            let mut file = file.lock().map_err(|_| LedgerError::Poisoned)?;
            file.write_all(&line)?;
            file.sync_data()?;
        }

        let row = state.records.len();
        state.rows.insert(record.id.clone(), row);
        state.records.push(record);

        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<AnnotationRecord> {
        let state = self.state.read().ok()?;
        state
            .rows
            .get(id)
            .and_then(|&row| state.records.get(row))
            .cloned()
    }

    /// All records in row order.
    pub fn all(&self) -> Vec<AnnotationRecord> {
        self.state
            .read()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.records.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses complete ledger lines, skipping rows that can't be trusted.
fn load(contents: &[u8]) -> LedgerState {
    let now = Instant::now();
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents);

    let mut state = LedgerState::default();
    for (line, record) in csv_reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                log::warn!("skipping unreadable ledger row {}: {err}", line + 2);
                continue;
            }
        };

        let (Some(id), Some(caption), Some(url), None) =
            (record.get(0), record.get(1), record.get(2), record.get(3))
        else {
            log::warn!(
                "skipping ledger row {} with {} fields",
                line + 2,
                record.len()
            );
            continue;
        };

        if id.is_empty() || state.rows.contains_key(id) {
            log::warn!("skipping duplicate or empty ledger id {id:?}");
            continue;
        }

        let row = state.records.len();
        state.rows.insert(id.to_string(), row);
        state.records.push(AnnotationRecord {
            id: id.to_string(),
            caption: caption.to_string(),
            source_url: url.to_string(),
        });
    }

    log::debug!(
        "took {}ms to read {} ledger rows",
        now.elapsed().as_micros() as f64 / 1000.0,
        state.records.len()
    );
    state
}

/// Length of the prefix made of complete, newline-terminated lines.
fn complete_len(contents: &[u8]) -> usize {
    contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0)
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\n', '\r'])
}

fn one_line(value: &str) -> String {
    value
        .split(['\n', '\r'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drops a partially written last line left behind by a crash mid-append.
///
/// Every complete record ends with a newline, so anything after the last
/// newline is a torn write.
fn repair_torn_tail(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = complete_len(&contents) as u64;

    log::warn!(
        "{}: dropping {} bytes of a torn trailing record",
        path.display(),
        len - keep
    );
    file.set_len(keep)?;
    file.sync_all()?;

    if keep == 0 {
        // header itself was torn
        file.seek(SeekFrom::Start(0))?;
        let mut csv_wrt = csv::Writer::from_writer(file);
        csv_wrt.write_record(CSV_HEADERS).map_err(std::io::Error::other)?;
        csv_wrt.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn record(id: &str) -> AnnotationRecord {
        AnnotationRecord {
            id: id.to_string(),
            caption: format!("a photo of {id}"),
            source_url: format!("https://media.example.com/{id}"),
        }
    }

    fn fresh_ledger() -> (Ledger, PathBuf, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let path = tmp.path().join("annotations.csv");
        let ledger = Ledger::open(&path).unwrap();
        (ledger, path, tmp)
    }

    #[test]
    fn test_open_creates_file_with_header() {
        let (ledger, path, _tmp) = fresh_ledger();
        assert!(ledger.is_empty());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "id,caption,url\n");
    }

    #[test]
    fn test_append_and_contains() {
        let (ledger, _, _tmp) = fresh_ledger();

        assert!(!ledger.contains("a"));
        assert!(ledger.append(record("a")).unwrap());
        assert!(ledger.contains("a"));
        assert_eq!(ledger.get("a"), Some(record("a")));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_duplicate_append_is_skipped() {
        let (ledger, path, _tmp) = fresh_ledger();

        assert!(ledger.append(record("a")).unwrap());
        let mut again = record("a");
        again.caption = "something else".to_string();
        assert!(!ledger.append(again).unwrap());

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("a").unwrap().caption, "a photo of a");

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_reopen_preserves_order_and_quoting() {
        let (ledger, path, _tmp) = fresh_ledger();

        let tricky = AnnotationRecord {
            id: "q".to_string(),
            caption: "a man, a dog and a \"frisbee\"\non two lines".to_string(),
            source_url: "https://x.example.com/q?a=1,2".to_string(),
        };
        ledger.append(record("b")).unwrap();
        ledger.append(tricky.clone()).unwrap();
        ledger.append(record("a")).unwrap();

        let reopened = Ledger::open(&path).unwrap();
        let ids: Vec<_> = reopened.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "q", "a"]);

        let q = reopened.get("q").unwrap();
        assert_eq!(q.caption, "a man, a dog and a \"frisbee\" on two lines");
        assert_eq!(q.source_url, tricky.source_url);
    }

    #[test]
    fn test_line_break_in_id_rejected() {
        let (ledger, _, _tmp) = fresh_ledger();
        let mut bad = record("a");
        bad.id = "a\nb".to_string();
        assert!(matches!(
            ledger.append(bad),
            Err(LedgerError::InvalidRecord(_))
        ));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_torn_tail_is_dropped_on_open() {
        let (ledger, path, _tmp) = fresh_ledger();
        ledger.append(record("a")).unwrap();
        ledger.append(record("b")).unwrap();
        drop(ledger);

        // simulate a crash halfway through the third append
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"c,a photo of c,https://me").unwrap();
        drop(file);

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(!reopened.contains("c"));

        // appending after repair yields a clean row
        reopened.append(record("c")).unwrap();
        let again = Ledger::open(&path).unwrap();
        assert_eq!(again.get("c"), Some(record("c")));
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_rows_with_wrong_field_count_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("annotations.csv");
        std::fs::write(
            &path,
            "id,caption,url\na,cap a,https://a\nbroken\nb,cap b,https://b,extra\nc,cap c,https://c\na,dup,https://a2\n",
        )
        .unwrap();

        let ledger = Ledger::open(&path).unwrap();
        let ids: Vec<_> = ledger.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(ledger.get("a").unwrap().source_url, "https://a");
    }

    #[test]
    fn test_concurrent_appends_keep_one_record_per_id() {
        let (ledger, path, _tmp) = fresh_ledger();
        let ledger = Arc::new(ledger);

        std::thread::scope(|s| {
            for _ in 0..8 {
                let ledger = ledger.clone();
                s.spawn(move || {
                    // every thread races on the same ids
                    for i in 0..20 {
                        ledger.append(record(&format!("id{i}"))).unwrap();
                    }
                });
            }
        });

        assert_eq!(ledger.len(), 20);
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 20);
    }

    #[test]
    fn test_read_only_open_leaves_torn_tail_for_writer() {
        let (writer, path, _tmp) = fresh_ledger();
        writer.append(record("a")).unwrap();

        // another writer is halfway through its next line
        let mut other = OpenOptions::new().append(true).open(&path).unwrap();
        other.write_all(b"b,a photo of b,https://").unwrap();
        let len = std::fs::metadata(&path).unwrap().len();

        let reader = Ledger::open_read_only(&path).unwrap();
        let ids: Vec<_> = reader.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

        other.write_all(b"media.example.com/b\n").unwrap();
        drop(other);

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.get("b"), Some(record("b")));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_read_only_ledger_rejects_appends() {
        let (writer, path, _tmp) = fresh_ledger();
        writer.append(record("a")).unwrap();

        let reader = Ledger::open_read_only(&path).unwrap();
        assert!(matches!(
            reader.append(record("b")),
            Err(LedgerError::ReadOnly)
        ));
        assert!(!reader.contains("b"));
        assert_eq!(Ledger::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_open_of_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("annotations.csv");

        let reader = Ledger::open_read_only(&path).unwrap();
        assert!(reader.is_empty());
        assert!(!path.exists());
    }
}

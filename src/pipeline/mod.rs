//! Fetch -> batch -> caption -> persist.
//!
//! A fixed pool of fetch workers downloads and decodes media while the
//! calling thread groups finished downloads into batches, captions each
//! batch with one model call and appends the results to the ledger as soon
//! as the batch returns.
//!
//! Failures are isolated: a bad download or undecodable file skips only that
//! item, a failed model call drops only that batch. Only a ledger write
//! failure ends the run early.

mod caption;
mod fetch;

pub use caption::{check_alignment, Captioner, HttpCaptioner, InferenceError};
pub use fetch::{FetchError, HttpFetcher, MediaFetcher};

use std::{
    collections::HashSet,
    ops::AddAssign,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Instant,
};

use image::RgbImage;
use indicatif::ProgressBar;

use crate::{
    images,
    ledger::{AnnotationRecord, Ledger, LedgerError, MediaItem},
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to persist annotation: {0}")]
    Ledger(#[from] LedgerError),
}

/// Counters for one `process` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items skipped because the ledger (or this run) already had them
    pub duplicates: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub decode_failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// Records appended to the ledger
    pub captioned: usize,
    /// Ids of every item that produced no record
    pub failed_ids: Vec<String>,
}

impl RunStats {
    pub fn failed(&self) -> usize {
        self.failed_ids.len()
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, other: Self) {
        self.duplicates += other.duplicates;
        self.fetched += other.fetched;
        self.fetch_failed += other.fetch_failed;
        self.decode_failed += other.decode_failed;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.captioned += other.captioned;
        self.failed_ids.extend(other.failed_ids);
    }
}

enum Fetched {
    Ready(MediaItem, RgbImage),
    FetchFailed(MediaItem, FetchError),
    DecodeFailed(MediaItem, anyhow::Error),
}

pub struct Pipeline {
    fetcher: Arc<dyn MediaFetcher>,
    captioner: Arc<dyn Captioner>,
    ledger: Arc<Ledger>,
    fetch_workers: usize,
    batch_size: usize,
    stop: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        captioner: Arc<dyn Captioner>,
        ledger: Arc<Ledger>,
        fetch_workers: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            fetcher,
            captioner,
            ledger,
            fetch_workers: fetch_workers.max(1),
            batch_size: batch_size.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Shares a stop flag with the caller. Once set, no new batch is
    /// started; the one being captioned finishes and is persisted.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Ticked once per persisted record
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Runs every item through fetch, caption and persist.
    ///
    /// `items` is pulled lazily from a feeder thread, so it can be a
    /// streaming catalog walk. Items already in the ledger are skipped.
    pub fn process<I>(&self, items: I) -> Result<RunStats, PipelineError>
    where
        I: IntoIterator<Item = MediaItem>,
        I::IntoIter: Send,
    {
        let started = Instant::now();
        let halt = AtomicBool::new(false);
        let should_halt = || self.stopped() || halt.load(Ordering::Relaxed);

        let (work_tx, work_rx) = mpsc::sync_channel::<MediaItem>(self.fetch_workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (done_tx, done_rx) = mpsc::channel::<Fetched>();

        let items = items.into_iter();

        let (result, duplicates) = std::thread::scope(|s| {
            let feeder = s.spawn(|| {
                let mut seen = HashSet::new();
                let mut duplicates = 0usize;
                for item in items {
                    if should_halt() {
                        break;
                    }
                    if self.ledger.contains(&item.id) || !seen.insert(item.id.clone()) {
                        duplicates += 1;
                        continue;
                    }
                    if work_tx.send(item).is_err() {
                        break;
                    }
                }
                drop(work_tx);
                duplicates
            });

            for worker in 0..self.fetch_workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let should_halt = &should_halt;
                s.spawn(move || {
                    log::trace!("fetch worker {worker} started");
                    loop {
                        if should_halt() {
                            break;
                        }
                        let next = match work_rx.lock() {
                            Ok(rx) => rx.recv(),
                            Err(_) => break,
                        };
                        let Ok(item) = next else { break };

                        let fetched = self.fetch_one(item);
                        if done_tx.send(fetched).is_err() {
                            break;
                        }
                    }
                });
            }
            // the pool holds the only senders now
            drop(done_tx);
            drop(work_rx);

            let result = self.dispatch(&done_rx);
            if result.is_err() {
                halt.store(true, Ordering::Relaxed);
            }
            drop(done_rx);

            let duplicates = feeder.join().unwrap_or_else(|err| {
                log::error!("feeder thread panicked: {err:?}");
                0
            });
            (result, duplicates)
        });

        let mut stats = result?;
        stats.duplicates += duplicates;

        log::info!(
            "pipeline: {} captioned, {} failed, {} duplicates in {:.1}s",
            stats.captioned,
            stats.failed(),
            stats.duplicates,
            started.elapsed().as_secs_f64()
        );

        Ok(stats)
    }

    fn fetch_one(&self, item: MediaItem) -> Fetched {
        match self.fetcher.fetch(&item.source_url) {
            Ok(bytes) => match images::decode_rgb(&bytes) {
                Ok(img) => Fetched::Ready(item, img),
                Err(err) => Fetched::DecodeFailed(item, err),
            },
            Err(err) => Fetched::FetchFailed(item, err),
        }
    }

    /// Groups fetch results into batches and captions them. Runs on the
    /// calling thread until every worker is done or a stop is requested.
    fn dispatch(&self, done_rx: &mpsc::Receiver<Fetched>) -> Result<RunStats, PipelineError> {
        let mut stats = RunStats::default();
        let mut batch: Vec<(MediaItem, RgbImage)> = Vec::with_capacity(self.batch_size);

        for fetched in done_rx.iter() {
            match fetched {
                Fetched::Ready(item, img) => {
                    stats.fetched += 1;
                    batch.push((item, img));
                }
                Fetched::FetchFailed(item, err) => {
                    log::warn!("skipping {}: download failed: {err}", item.id);
                    stats.fetch_failed += 1;
                    stats.failed_ids.push(item.id);
                }
                Fetched::DecodeFailed(item, err) => {
                    log::warn!("skipping {}: {err:#}", item.id);
                    stats.decode_failed += 1;
                    stats.failed_ids.push(item.id);
                }
            }

            if batch.len() >= self.batch_size {
                self.run_batch(std::mem::take(&mut batch), &mut stats)?;
                if self.stopped() {
                    log::warn!("stop requested, finishing after batch {}", stats.batches);
                    return Ok(stats);
                }
            }
        }

        if self.stopped() {
            if !batch.is_empty() {
                log::warn!(
                    "stop requested, {} downloaded items left for the next run",
                    batch.len()
                );
            }
            return Ok(stats);
        }

        if !batch.is_empty() {
            self.run_batch(batch, &mut stats)?;
        }

        Ok(stats)
    }

    fn run_batch(
        &self,
        batch: Vec<(MediaItem, RgbImage)>,
        stats: &mut RunStats,
    ) -> Result<(), PipelineError> {
        stats.batches += 1;
        let (items, imgs): (Vec<MediaItem>, Vec<RgbImage>) = batch.into_iter().unzip();

        let started = Instant::now();
        let captions = match self
            .captioner
            .caption(&imgs)
            .and_then(|captions| check_alignment(imgs.len(), captions))
        {
            Ok(captions) => captions,
            Err(err) => {
                log::error!(
                    "batch {} of {} items dropped: {err}",
                    stats.batches,
                    items.len()
                );
                stats.failed_batches += 1;
                stats.failed_ids.extend(items.into_iter().map(|item| item.id));
                return Ok(());
            }
        };

        log::debug!(
            "batch {}: {} captions in {}ms",
            stats.batches,
            captions.len(),
            started.elapsed().as_millis()
        );

        for (item, caption) in items.into_iter().zip(captions) {
            let record = AnnotationRecord {
                id: item.id,
                caption,
                source_url: item.source_url,
            };
            if self.ledger.append(record)? {
                stats.captioned += 1;
                if let Some(progress) = &self.progress {
                    progress.inc(1);
                }
            } else {
                stats.duplicates += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct PngFetcher {
        fail_urls: HashSet<String>,
        calls: AtomicUsize,
    }

    impl PngFetcher {
        fn new() -> Self {
            Self {
                fail_urls: HashSet::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MediaFetcher for PngFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_urls.contains(url) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            if url.ends_with("/garbage") {
                return Ok(vec![1, 2, 3]);
            }
            // width encodes the item number so captions can be checked
            let n: u32 = url.rsplit('/').next().unwrap().parse().unwrap();
            Ok(images::test_png(n + 1, 1))
        }
    }

    /// Captions each image with its width, records batch sizes.
    struct WidthCaptioner {
        batch_sizes: Mutex<Vec<usize>>,
        fail_batch: Option<usize>,
        short_by_one: bool,
    }

    impl WidthCaptioner {
        fn new() -> Self {
            Self {
                batch_sizes: Mutex::new(vec![]),
                fail_batch: None,
                short_by_one: false,
            }
        }
    }

    impl Captioner for WidthCaptioner {
        fn caption(&self, imgs: &[RgbImage]) -> Result<Vec<String>, InferenceError> {
            let mut sizes = self.batch_sizes.lock().unwrap();
            sizes.push(imgs.len());
            if self.fail_batch == Some(sizes.len()) {
                return Err(InferenceError::Status {
                    status: 500,
                    body: "model crashed".to_string(),
                });
            }
            let mut captions: Vec<_> = imgs
                .iter()
                .map(|img| format!("item {}", img.width() - 1))
                .collect();
            if self.short_by_one {
                captions.pop();
            }
            Ok(captions)
        }
    }

    fn items(n: usize) -> Vec<MediaItem> {
        (0..n)
            .map(|i| MediaItem {
                id: format!("id{i}"),
                source_url: format!("https://m.example.com/{i}"),
            })
            .collect()
    }

    fn pipeline(
        fetcher: PngFetcher,
        captioner: Arc<WidthCaptioner>,
        workers: usize,
        batch: usize,
    ) -> (Pipeline, Arc<Ledger>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(tmp.path().join("annotations.csv")).unwrap());
        let pipeline = Pipeline::new(Arc::new(fetcher), captioner, ledger.clone(), workers, batch);
        (pipeline, ledger, tmp)
    }

    #[test]
    fn test_every_record_matches_its_image() {
        let captioner = Arc::new(WidthCaptioner::new());
        let (pipeline, ledger, _tmp) = pipeline(PngFetcher::new(), captioner.clone(), 4, 25);

        let stats = pipeline.process(items(60)).unwrap();

        assert_eq!(stats.captioned, 60);
        assert_eq!(stats.batches, 3);
        assert_eq!(*captioner.batch_sizes.lock().unwrap(), vec![25, 25, 10]);
        for record in ledger.all() {
            let n = record.id.trim_start_matches("id");
            assert_eq!(record.caption, format!("item {n}"));
            assert_eq!(record.source_url, format!("https://m.example.com/{n}"));
        }
    }

    #[test]
    fn test_failed_download_skips_only_that_item() {
        let mut fetcher = PngFetcher::new();
        fetcher.fail_urls.insert("https://m.example.com/7".to_string());
        let captioner = Arc::new(WidthCaptioner::new());
        let (pipeline, ledger, _tmp) = pipeline(fetcher, captioner.clone(), 4, 25);

        let stats = pipeline.process(items(25)).unwrap();

        assert_eq!(stats.captioned, 24);
        assert_eq!(stats.fetch_failed, 1);
        assert_eq!(stats.failed_ids, vec!["id7".to_string()]);
        assert_eq!(ledger.len(), 24);
        assert!(!ledger.contains("id7"));
        assert_eq!(*captioner.batch_sizes.lock().unwrap(), vec![24]);
    }

    #[test]
    fn test_undecodable_bytes_are_isolated() {
        let captioner = Arc::new(WidthCaptioner::new());
        let (pipeline, ledger, _tmp) = pipeline(PngFetcher::new(), captioner, 2, 5);

        let mut input = items(3);
        input.push(MediaItem {
            id: "bad".to_string(),
            source_url: "https://m.example.com/garbage".to_string(),
        });

        let stats = pipeline.process(input).unwrap();
        assert_eq!(stats.captioned, 3);
        assert_eq!(stats.decode_failed, 1);
        assert!(!ledger.contains("bad"));
    }

    #[test]
    fn test_inference_failure_drops_batch_and_continues() {
        let mut captioner = WidthCaptioner::new();
        captioner.fail_batch = Some(1);
        let captioner = Arc::new(captioner);
        // one worker keeps batch membership deterministic
        let (pipeline, ledger, _tmp) = pipeline(PngFetcher::new(), captioner, 1, 10);

        let stats = pipeline.process(items(25)).unwrap();

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.captioned, 15);
        assert_eq!(stats.failed(), 10);
        assert!(!ledger.contains("id0"));
        assert!(ledger.contains("id24"));
    }

    #[test]
    fn test_misaligned_captions_drop_batch() {
        let mut captioner = WidthCaptioner::new();
        captioner.short_by_one = true;
        let (pipeline, ledger, _tmp) = pipeline(PngFetcher::new(), Arc::new(captioner), 2, 4);

        let stats = pipeline.process(items(4)).unwrap();
        assert_eq!(stats.failed_batches, 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let captioner = Arc::new(WidthCaptioner::new());
        let fetcher = PngFetcher::new();
        let (pipeline, ledger, _tmp) = pipeline(fetcher, captioner.clone(), 3, 7);

        pipeline.process(items(20)).unwrap();
        assert_eq!(ledger.len(), 20);

        let stats = pipeline.process(items(20)).unwrap();
        assert_eq!(stats.captioned, 0);
        assert_eq!(stats.duplicates, 20);
        assert_eq!(stats.batches, 0);
        assert_eq!(ledger.len(), 20);
    }

    #[test]
    fn test_duplicate_ids_in_input_processed_once() {
        let captioner = Arc::new(WidthCaptioner::new());
        let (pipeline, ledger, _tmp) = pipeline(PngFetcher::new(), captioner, 2, 5);

        let mut input = items(3);
        input.extend(items(3));
        let stats = pipeline.process(input).unwrap();

        assert_eq!(stats.captioned, 3);
        assert_eq!(stats.duplicates, 3);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_items_already_in_ledger_are_skipped() {
        let captioner = Arc::new(WidthCaptioner::new());
        let fetcher = Arc::new(PngFetcher::new());
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(tmp.path().join("annotations.csv")).unwrap());
        ledger
            .append(AnnotationRecord {
                id: "id1".to_string(),
                caption: "c".to_string(),
                source_url: "u".to_string(),
            })
            .unwrap();
        let pipeline = Pipeline::new(fetcher.clone(), captioner, ledger.clone(), 1, 5);

        let stats = pipeline.process(items(3)).unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.captioned, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.get("id1").unwrap().caption, "c");
    }

    #[test]
    fn test_stop_before_start_processes_nothing() {
        let captioner = Arc::new(WidthCaptioner::new());
        let (pipeline, ledger, _tmp) = pipeline(PngFetcher::new(), captioner.clone(), 2, 5);
        let pipeline = pipeline.with_stop_flag(Arc::new(AtomicBool::new(true)));

        let stats = pipeline.process(items(10)).unwrap();
        assert_eq!(stats.captioned, 0);
        assert!(ledger.is_empty());
        assert!(captioner.batch_sizes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stop_after_first_batch_persists_it() {
        struct StopAfterFirst {
            inner: WidthCaptioner,
            stop: Arc<AtomicBool>,
        }
        impl Captioner for StopAfterFirst {
            fn caption(&self, imgs: &[RgbImage]) -> Result<Vec<String>, InferenceError> {
                self.stop.store(true, Ordering::SeqCst);
                self.inner.caption(imgs)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(tmp.path().join("annotations.csv")).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let captioner = Arc::new(StopAfterFirst {
            inner: WidthCaptioner::new(),
            stop: stop.clone(),
        });
        let pipeline = Pipeline::new(Arc::new(PngFetcher::new()), captioner, ledger.clone(), 1, 5)
            .with_stop_flag(stop);

        let stats = pipeline.process(items(50)).unwrap();

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.captioned, 5);
        assert_eq!(ledger.len(), 5);
    }

    #[test]
    fn test_empty_input() {
        let captioner = Arc::new(WidthCaptioner::new());
        let (pipeline, _ledger, _tmp) = pipeline(PngFetcher::new(), captioner, 4, 25);
        let stats = pipeline.process(Vec::new()).unwrap();
        assert_eq!(stats, RunStats::default());
    }
}

//! Cross-module tests and the fixtures they share with `web`.


use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use image::RgbImage;

use crate::{
    app::{AppContext, AppPaths},
    cache::MediaCache,
    catalog::{CatalogApi, CatalogError, Credential, Page},
    config::Config,
    images,
    ledger::{AnnotationRecord, Ledger, MediaItem},
    pipeline::{Captioner, FetchError, InferenceError, MediaFetcher},
    semantic::{FixedEmbedder, SearchService, TableStorage},
    storage::BackendLocal,
};

/// Serves `https://m.example.com/<n>` as an n x 1 png; anything else 404s.
#[derive(Default)]
pub struct MockFetcher {
    pub calls: AtomicUsize,
}

impl MediaFetcher for MockFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match url.rsplit('/').next().and_then(|n| n.parse::<u32>().ok()) {
            Some(width) if width > 0 => Ok(images::test_png(width, 1)),
            _ => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

/// Captions by image width, so each test image has a known caption.
#[derive(Default)]
pub struct WidthCaptioner {
    pub calls: AtomicUsize,
}

impl Captioner for WidthCaptioner {
    fn caption(&self, imgs: &[RgbImage]) -> Result<Vec<String>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(imgs
            .iter()
            .map(|img| match img.width() {
                1 => "a red car",
                2 => "a green tree",
                3 => "a blue sky",
                _ => "something else",
            })
            .map(String::from)
            .collect())
    }
}

/// Fixed pages of items; cursor is the page index.
pub struct MockCatalog {
    pub pages: Vec<Vec<MediaItem>>,
    /// Page index answered with an auth error, every time
    pub reject_page: Option<usize>,
    pub requests: Mutex<Vec<Option<String>>>,
}

impl MockCatalog {
    pub fn new(pages: Vec<Vec<MediaItem>>) -> Self {
        Self {
            pages,
            reject_page: None,
            requests: Mutex::new(vec![]),
        }
    }
}

impl CatalogApi for MockCatalog {
    fn search_page(
        &self,
        cursor: Option<&str>,
        _page_size: u32,
        _credential: &Credential,
    ) -> Result<Page, CatalogError> {
        self.requests.lock().unwrap().push(cursor.map(String::from));

        let page: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        if self.reject_page == Some(page) {
            return Err(crate::catalog::AuthError::Rejected.into());
        }

        Ok(Page {
            items: self.pages[page].clone(),
            next_page_token: (page + 1 < self.pages.len()).then(|| (page + 1).to_string()),
        })
    }
}

pub fn item(id: &str, n: u32) -> MediaItem {
    MediaItem {
        id: id.to_string(),
        source_url: format!("https://m.example.com/{n}"),
    }
}

pub fn embedder() -> FixedEmbedder {
    FixedEmbedder::new(
        3,
        &[
            ("a red car", vec![1.0, 0.0, 0.0]),
            ("a green tree", vec![0.0, 1.0, 0.0]),
            ("a blue sky", vec![0.0, 0.0, 1.0]),
            ("something else", vec![0.3, 0.3, 0.3]),
            ("red", vec![0.9, 0.05, 0.05]),
            ("blue", vec![0.05, 0.05, 0.9]),
        ],
    )
}

pub struct TestContext {
    pub ctx: Arc<AppContext>,
    pub fetcher: Arc<MockFetcher>,
    pub search: Arc<SearchService>,
    _tmp: tempfile::TempDir,
}

impl TestContext {
    /// Fresh base directory with an empty ledger and no index.
    pub fn empty(auth_token: Option<&str>) -> Self {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let paths = AppPaths::new(tmp.path());

        let mut config = Config::load_with(tmp.path()).expect("failed to load config");
        config.server.auth_token = auth_token.map(String::from);
        config.pipeline.fetch_workers = 2;
        config.pipeline.batch_size = 2;

        let ledger = Arc::new(Ledger::open(paths.ledger()).expect("failed to open ledger"));
        let fetcher = Arc::new(MockFetcher::default());
        let store = Arc::new(BackendLocal::new(paths.cache_dir()).expect("failed to create cache"));
        let cache = Arc::new(MediaCache::new(store, ledger.clone(), fetcher.clone(), true));
        let search = Arc::new(SearchService::new(
            Arc::new(embedder()),
            TableStorage::new(paths.table()),
            16,
        ));

        let ctx = AppContext::new(config, paths, ledger, fetcher.clone(), cache)
            .with_search_service(search.clone());

        Self {
            ctx: Arc::new(ctx),
            fetcher,
            search,
            _tmp: tmp,
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }
}

/// Three indexed records (car, tree, sky) plus one appended after the last
/// index build whose media can't be downloaded.
pub fn create_context(auth_token: Option<&str>) -> TestContext {
    let test = TestContext::empty(auth_token);
    let ledger = test.ctx.ledger();

    for (id, caption, n) in [("car", "a red car", 1), ("tree", "a green tree", 2), ("sky", "a blue sky", 3)] {
        ledger
            .append(AnnotationRecord {
                id: id.to_string(),
                caption: caption.to_string(),
                source_url: format!("https://m.example.com/{n}"),
            })
            .unwrap();
    }
    test.search.rebuild(ledger).unwrap();

    ledger
        .append(AnnotationRecord {
            id: "broken".to_string(),
            caption: "a broken link".to_string(),
            source_url: "https://m.example.com/broken".to_string(),
        })
        .unwrap();

    test
}

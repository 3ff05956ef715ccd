use std::{thread::sleep, time::Duration};

use rand::random;
use reqwest::{blocking::Client, StatusCode};

const USER_AGENT: &str = concat!("stickme/", env!("CARGO_PKG_VERSION"));
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{url}: server responded {status}")]
    Status { url: String, status: u16 },

    #[error("{url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Downloads media bytes.
pub trait MediaFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blocking reqwest downloader.
///
/// Transport errors and 5xx responses are retried with exponential backoff;
/// 4xx answers fail immediately.
pub struct HttpFetcher {
    client: Client,
    max_retries: u8,
    base_delay: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_retries: u8) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            max_retries,
            base_delay: Duration::from_millis(500),
        })
    }

    fn backoff(&self, attempt: u8) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1) as u32)
            .unwrap_or(u32::MAX);
        let exp = self.base_delay.saturating_mul(factor).min(MAX_BACKOFF);
        exp + Duration::from_millis(rand_jitter())
    }

    fn fetch_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self.client.get(url).send().map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = resp.bytes().map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

impl MediaFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0u8;
        loop {
            match self.fetch_once(url) {
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    log::debug!(
                        "{err}: retrying (attempt {attempt}/{}), backoff {}ms",
                        self.max_retries,
                        delay.as_millis()
                    );
                    sleep(delay);
                }
                result => return result,
            }
        }
    }
}

fn is_retryable(err: &FetchError) -> bool {
    match err {
        FetchError::Status { status, .. } => StatusCode::from_u16(*status)
            .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
            .unwrap_or(false),
        FetchError::Http { source, .. } => !source.is_builder() && !source.is_redirect(),
    }
}

fn rand_jitter() -> u64 {
    random::<u64>() % 250
}

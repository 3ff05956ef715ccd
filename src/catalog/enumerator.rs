use std::sync::Arc;

use super::{CatalogApi, CatalogError, CredentialProvider, Page};
use crate::ledger::MediaItem;

/// Walks the catalog one page at a time.
///
/// Iterating yields `Ok(page items)` until the catalog stops returning a
/// cursor. A rejected credential is refreshed and the same page is
/// re-requested, at most `auth_retries` times in a row. Any error is yielded
/// once and ends the walk.
pub struct Enumerator {
    api: Arc<dyn CatalogApi>,
    credentials: Arc<dyn CredentialProvider>,
    page_size: u32,
    auth_retries: u8,

    cursor: Option<String>,
    done: bool,
    pages: usize,
}

impl Enumerator {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        credentials: Arc<dyn CredentialProvider>,
        page_size: u32,
        auth_retries: u8,
    ) -> Self {
        Self {
            api,
            credentials,
            page_size,
            auth_retries,
            cursor: None,
            done: false,
            pages: 0,
        }
    }

    /// Pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn fetch_page(&self) -> Result<Page, CatalogError> {
        let cursor = self.cursor.as_deref();
        let mut credential = self.credentials.credential()?;
        let mut attempt = 0u8;

        loop {
            match self.api.search_page(cursor, self.page_size, &credential) {
                Err(CatalogError::Auth(err)) if attempt < self.auth_retries => {
                    attempt += 1;
                    log::warn!(
                        "catalog rejected credential ({err}), refreshing (attempt {attempt}/{})",
                        self.auth_retries
                    );
                    credential = self.credentials.refresh()?;
                }
                result => return result,
            }
        }
    }
}

impl Iterator for Enumerator {
    type Item = Result<Vec<MediaItem>, CatalogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.fetch_page() {
            Ok(page) => {
                self.pages += 1;
                log::debug!(
                    "catalog page {} with {} items",
                    self.pages,
                    page.items.len()
                );
                match page.next_page_token {
                    Some(token) => self.cursor = Some(token),
                    None => self.done = true,
                }
                Some(Ok(page.items))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

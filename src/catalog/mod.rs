//! Remote media catalog access.
//!
//! - `client`: blocking HTTP client for the paged search endpoint
//! - `credentials`: bearer credential sources
//! - `enumerator`: lazy page-by-page walk with refresh-and-retry on auth failure

mod client;
mod credentials;
mod enumerator;

pub use client::HttpCatalog;
pub use credentials::{AuthError, Credential, CredentialProvider, StaticCredential, TokenFile};
pub use enumerator::Enumerator;

use crate::ledger::MediaItem;

/// One page of catalog results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<MediaItem>,
    /// Opaque cursor for the following page; `None` on the last page
    pub next_page_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("catalog returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected catalog response: {0}")]
    Decode(String),
}

/// Paged search over a remote catalog.
pub trait CatalogApi: Send + Sync {
    /// Requests the page starting at `cursor` (`None` for the first page).
    ///
    /// Must return `CatalogError::Auth` when `credential` is rejected so the
    /// caller can refresh and re-issue the same request.
    fn search_page(
        &self,
        cursor: Option<&str>,
        page_size: u32,
        credential: &Credential,
    ) -> Result<Page, CatalogError>;
}

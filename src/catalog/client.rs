use std::time::Duration;

use reqwest::{blocking::Client, header::AUTHORIZATION, StatusCode};
use serde::{Deserialize, Serialize};

use super::{AuthError, CatalogApi, CatalogError, Credential, Page};
use crate::{config::CatalogConfig, ledger::MediaItem};

const USER_AGENT: &str = concat!("stickme/", env!("CARGO_PKG_VERSION"));

/// Blocking client for a Google Photos style `mediaItems:search` endpoint.
pub struct HttpCatalog {
    client: Client,
    endpoint: String,
    album_id: Option<String>,
    download_suffix: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    album_id: Option<&'a str>,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default, alias = "mediaItems")]
    items: Vec<RemoteItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct RemoteItem {
    #[serde(default)]
    id: String,
    #[serde(default, alias = "baseUrl")]
    url: String,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig, timeout: Duration) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        let endpoint = format!(
            "{}/v1/mediaItems:search",
            config.base_url.trim_end_matches('/')
        );

        Ok(Self {
            client,
            endpoint,
            album_id: config.album_id.clone(),
            download_suffix: config.download_suffix.clone(),
        })
    }

    fn into_page(&self, response: SearchResponse) -> Page {
        let items = response
            .items
            .into_iter()
            .filter_map(|item| {
                if item.id.is_empty() || item.url.is_empty() {
                    log::warn!("catalog item without id or url skipped: {:?}", item.id);
                    return None;
                }
                let source_url = match &self.download_suffix {
                    Some(suffix) => format!("{}{suffix}", item.url),
                    None => item.url,
                };
                Some(MediaItem {
                    id: item.id,
                    source_url,
                })
            })
            .collect();

        Page {
            items,
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        }
    }
}

impl CatalogApi for HttpCatalog {
    fn search_page(
        &self,
        cursor: Option<&str>,
        page_size: u32,
        credential: &Credential,
    ) -> Result<Page, CatalogError> {
        let request = SearchRequest {
            album_id: self.album_id.as_deref(),
            page_size,
            page_token: cursor,
        };

        log::debug!("catalog: requesting page {cursor:?}");

        let resp = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", credential.token()))
            .json(&request)
            .send()?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected.into());
        }

        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let bytes = resp.bytes()?;
        // empty albums may answer with an empty body
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(self.into_page(SearchResponse::default()));
        }

        let response: SearchResponse = serde_json::from_slice(&bytes)
            .map_err(|err| CatalogError::Decode(err.to_string()))?;

        Ok(self.into_page(response))
    }
}

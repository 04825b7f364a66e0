//! Steam Workshop metadata scraper
//!
//! Fetches a public item page and reads the item name, declared game
//! versions and required items out of it. Only the HTTP fetch can fail;
//! extraction is best effort (see [`extract`]).

pub mod extract;

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{ErrorKind, ModVersionInfo};

/// Item detail page, `?id=<item>` is appended
pub const ITEM_PAGE_URL: &str = "https://steamcommunity.com/sharedfiles/filedetails/";

/// Per-request timeout for page fetches
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

// Steam serves a reduced page to unknown agents
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Scraper errors. Only raised when the page could not be fetched.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Failed to fetch mod information for {item_id}: {source}")]
    Request {
        item_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to fetch mod information for {item_id}: HTTP {status}")]
    Status {
        item_id: String,
        status: reqwest::StatusCode,
    },
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Network
    }
}

/// Source of item metadata, swappable so the request queue never depends
/// on the page layout
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn scrape_version_info(&self, item_id: &str) -> Result<ModVersionInfo, ScrapeError>;
}

/// Scraper for steamcommunity.com item pages
pub struct WorkshopScraper {
    client: Client,
    base_url: String,
}

impl WorkshopScraper {
    pub fn new() -> Result<Self, ScrapeError> {
        // Single known host; its certificate chain is not worth failing over
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(ScrapeError::Client)?;

        Ok(Self {
            client,
            base_url: ITEM_PAGE_URL.to_string(),
        })
    }

    /// Point at a different page host (mirrors, local fixtures)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn item_url(&self, item_id: &str) -> String {
        format!("{}?id={}", self.base_url, item_id)
    }

    async fn fetch_page(&self, item_id: &str) -> Result<String, ScrapeError> {
        let url = self.item_url(item_id);
        debug!("Fetching workshop page: {}", url);

        let response = self
            .client
            .get(&url)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .send()
            .await
            .map_err(|source| ScrapeError::Request {
                item_id: item_id.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                item_id: item_id.to_string(),
                status,
            });
        }

        response.text().await.map_err(|source| ScrapeError::Request {
            item_id: item_id.to_string(),
            source,
        })
    }
}

#[async_trait]
impl MetadataSource for WorkshopScraper {
    async fn scrape_version_info(&self, item_id: &str) -> Result<ModVersionInfo, ScrapeError> {
        let html = self.fetch_page(item_id).await?;
        let info = extract::parse_item_page(&html, item_id);

        info!(
            "Mod {} ({}): {} versions, {} dependencies",
            item_id,
            info.mod_name,
            info.supported_versions.len(),
            info.dependencies.len()
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_url() {
        let scraper = WorkshopScraper::new().unwrap();
        assert_eq!(
            scraper.item_url("2009463077"),
            "https://steamcommunity.com/sharedfiles/filedetails/?id=2009463077"
        );

        let scraper = scraper.with_base_url("http://127.0.0.1:9/filedetails/");
        assert_eq!(scraper.item_url("5"), "http://127.0.0.1:9/filedetails/?id=5");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        // Port 9 (discard) on loopback refuses connections without leaving
        // the machine
        let scraper = WorkshopScraper::new()
            .unwrap()
            .with_base_url("http://127.0.0.1:9/filedetails/");

        let err = scraper.scrape_version_info("5").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("Failed to fetch mod information for 5"));
    }
}

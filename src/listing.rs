//! Listing endpoint client.
//!
//! A listing is a JSON array of objects, each with an `image.url` field:
//!
//! ```json
//! [{ "image": { "url": "https://example.com/a.jpg" } }]
//! ```

use crate::errors::{PipelineError, PipelineResult};
use crate::utils::UrlUtils;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct ListingEntry {
    pub image: ListingImage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingImage {
    pub url: String,
}

/// Image identifiers in listing order. Unknown fields are ignored.
pub fn parse_listing(body: &[u8]) -> PipelineResult<Vec<String>> {
    let entries: Vec<ListingEntry> = serde_json::from_slice(body)
        .map_err(|e| PipelineError::malformed(format!("invalid listing JSON: {e}")))?;
    Ok(entries.into_iter().map(|entry| entry.image.url).collect())
}

pub async fn fetch_listing(client: &Client, url: &str) -> PipelineResult<Vec<String>> {
    let display_url = UrlUtils::obfuscate_credentials(url);
    debug!("Fetching listing from {}", display_url);

    let response = client.get(url).send().await.map_err(|e| e.without_url())?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::HttpStatus {
            status: status.as_u16(),
            url: display_url,
        });
    }

    let body = response.bytes().await.map_err(|e| e.without_url())?;
    let identifiers = parse_listing(&body)?;
    debug!("Listing {} returned {} images", display_url, identifiers.len());
    Ok(identifiers)
}

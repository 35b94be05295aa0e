//! Fetching the upstream VRP document and the optional SLURM file.
//!
//! Both are plain HTTPS (or `file://`) resources identified by a URI
//! string in [`Config`]. Each fetch is conditional on the ETag returned
//! by the previous successful fetch, so an unchanged upstream costs a
//! single round trip and no JSON parsing.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;

use crate::error::Failed;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The result of a single fetch attempt.
pub enum FetchResult {
    /// The resource hasn't changed since the last successful fetch.
    Unchanged,

    /// New content, plus the ETag to remember for next time (if any).
    Changed { body: String, etag: Option<String> },
}

/// Fetches one resource, remembering the previous ETag for conditional requests.
pub struct Fetcher {
    client: reqwest::Client,
    uri: String,
    etag: Option<String>,
}

impl Fetcher {
    pub fn new(uri: String) -> Self {
        Fetcher {
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("building the HTTP client"),
            uri,
            etag: None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Fetches the resource, returning `Unchanged` if the ETag still matches.
    pub async fn fetch(&mut self) -> Result<FetchResult, Failed> {
        if let Some(path) = self.uri.strip_prefix("file://") {
            return self.fetch_file(path);
        }
        self.fetch_http().await
    }

    fn fetch_file(&mut self, path: &str) -> Result<FetchResult, Failed> {
        let body = fs::read_to_string(Path::new(path)).map_err(|err| {
            warn!("Failed to read '{}': {}", path, err);
            Failed
        })?;
        Ok(FetchResult::Changed { body, etag: None })
    }

    async fn fetch_http(&mut self) -> Result<FetchResult, Failed> {
        let mut request = self.client.get(&self.uri);
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag.clone());
        }
        let response = request.send().await.map_err(|err| {
            warn!("Failed to fetch '{}': {}", self.uri, err);
            Failed
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("'{}' unchanged (304).", self.uri);
            return Ok(FetchResult::Unchanged);
        }
        if !response.status().is_success() {
            warn!("Failed to fetch '{}': server returned {}", self.uri, response.status());
            return Err(Failed);
        }

        let etag = response.headers().get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|err| {
            warn!("Failed to read response body from '{}': {}", self.uri, err);
            Failed
        })?;

        if etag.is_some() && etag == self.etag {
            debug!("'{}' unchanged (matching ETag).", self.uri);
            return Ok(FetchResult::Unchanged);
        }
        self.etag = etag.clone();
        info!("Fetched new content from '{}'.", self.uri);
        Ok(FetchResult::Changed { body, etag })
    }
}

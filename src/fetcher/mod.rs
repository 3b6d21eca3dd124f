//! Byte resolution for a request: attached bytes, then disk, then network.

use crate::cache::disk::ByteStore;
use crate::cache::key::CacheKey;
use crate::config::HttpConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::utils::UrlUtils;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

/// Initial buffer size when the response length is unknown
const READ_SIZE: usize = 2048;

/// A network-side producer of encoded image bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch the full body for `identifier`, observing `cancel` between reads.
    async fn fetch(&self, identifier: &str, cancel: &CancellationToken) -> PipelineResult<Bytes>;
}

/// Single-attempt HTTP GET source
pub struct HttpImageSource {
    client: Client,
}

impl HttpImageSource {
    /// Client with a connection deadline only, so long transfers stay cancellable
    pub fn new(config: &HttpConfig) -> PipelineResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, identifier: &str, cancel: &CancellationToken) -> PipelineResult<Bytes> {
        let url = Url::parse(identifier).map_err(|e| {
            PipelineError::malformed(format!(
                "invalid URL '{}': {e}",
                UrlUtils::obfuscate_credentials(identifier)
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PipelineError::malformed(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let display_url = UrlUtils::obfuscate_credentials(identifier);

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            response = self.client.get(url).send() => response.map_err(|e| e.without_url())?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                status: status.as_u16(),
                url: display_url,
            });
        }

        let expected = response.content_length();
        let mut body = Vec::new();
        let initial = expected
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(READ_SIZE);
        body.try_reserve_exact(initial).map_err(|e| {
            PipelineError::exhausted(format!("cannot buffer {initial} byte body: {e}"))
        })?;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                chunk = response.chunk() => chunk.map_err(|e| e.without_url())?,
            };
            let Some(chunk) = chunk else { break };

            if let Some(expected) = expected
                && (body.len() + chunk.len()) as u64 > expected
            {
                return Err(PipelineError::io(
                    format!("reading {display_url}"),
                    io::Error::new(io::ErrorKind::InvalidData, "body exceeds content-length"),
                ));
            }
            body.try_reserve(chunk.len()).map_err(|e| {
                PipelineError::exhausted(format!("cannot grow body buffer: {e}"))
            })?;
            body.extend_from_slice(&chunk);
            trace!("Read {} bytes from {} ({} total)", chunk.len(), display_url, body.len());
        }

        if let Some(expected) = expected
            && (body.len() as u64) < expected
        {
            return Err(PipelineError::io(
                format!("reading {display_url}"),
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {} bytes", body.len(), expected),
                ),
            ));
        }

        debug!("Fetched {} bytes from {}", body.len(), display_url);
        Ok(Bytes::from(body))
    }
}

/// What the fetcher needs to know about one request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub identifier: String,
    pub key: CacheKey,
    /// Bytes supplied by the caller; skip both lookups
    pub attached: Option<Bytes>,
    pub disk_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    Attached,
    Disk,
    Network,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Bytes,
    pub origin: FetchOrigin,
}

pub struct Fetcher {
    disk: Arc<ByteStore>,
    source: Arc<dyn ImageSource>,
}

impl Fetcher {
    pub fn new(disk: Arc<ByteStore>, source: Arc<dyn ImageSource>) -> Self {
        Self { disk, source }
    }

    /// Resolve the encoded bytes for `request`.
    ///
    /// Network results are written to the disk tier unless the request was
    /// cancelled while the transfer was running.
    pub async fn resolve(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<Fetched> {
        if let Some(bytes) = request.attached {
            return Ok(Fetched {
                bytes,
                origin: FetchOrigin::Attached,
            });
        }

        if request.disk_cache {
            let disk = Arc::clone(&self.disk);
            let key = request.key.clone();
            let cached = tokio::task::spawn_blocking(move || disk.get(&key))
                .await
                .unwrap_or_else(|e| {
                    warn!("Disk lookup task failed: {}", e);
                    None
                });
            if let Some(bytes) = cached {
                debug!("Disk cache hit for {}", request.key);
                return Ok(Fetched {
                    bytes: Bytes::from(bytes),
                    origin: FetchOrigin::Disk,
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let bytes = self.source.fetch(&request.identifier, cancel).await?;
        if cancel.is_cancelled() {
            debug!(
                "Discarding {} bytes for cancelled {}",
                bytes.len(),
                UrlUtils::obfuscate_credentials(&request.identifier)
            );
            return Err(PipelineError::Cancelled);
        }

        if request.disk_cache {
            let disk = Arc::clone(&self.disk);
            let key = request.key;
            let payload = bytes.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || disk.put_if_absent(&key, &payload)).await
            {
                warn!("Disk write task failed: {}", e);
            }
        }

        Ok(Fetched {
            bytes,
            origin: FetchOrigin::Network,
        })
    }
}

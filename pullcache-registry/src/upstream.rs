//! # Upstream Registry Client
//!
//! [`HttpRemoteRegistry`] talks to the registry a proxy project mirrors over
//! the OCI distribution v2 API:
//!
//! | operation        | request                                 |
//! |------------------|-----------------------------------------|
//! | `manifest_exist` | `HEAD /v2/<repository>/manifests/<ref>` |
//! | `manifest`       | `GET /v2/<repository>/manifests/<ref>`  |
//! | `blob_reader`    | `GET /v2/<repository>/blobs/<digest>`   |
//!
//! Blob bodies are streamed chunk by chunk and never buffered whole.
//! Non-success statuses are classified with
//! [`ProxyError::from_upstream_status`], so a 429 from upstream becomes a
//! rate-limit error the controller can fall back on.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use pullcache_core::types::{
    MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
use pullcache_core::{
    is_digest, BlobStream, Descriptor, Manifest, ProxyError, ProxyResult, RemoteRegistry,
};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const DIGEST_HEADER: &str = "docker-content-digest";

/// Connection settings for the upstream registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the registry, e.g. `https://registry-1.docker.io`
    pub url: String,
    /// Timeout for manifest requests and for connecting, in seconds.
    /// Blob downloads are not bounded by it once the body is streaming.
    pub timeout_secs: u64,
    pub user_agent: String,
    /// When false every lookup answers `NotFound`
    pub enabled: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://registry-1.docker.io".to_string(),
            timeout_secs: 30,
            user_agent: format!("pullcache/{}", env!("CARGO_PKG_VERSION")),
            enabled: true,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub struct HttpRemoteRegistry {
    client: Client,
    base_url: String,
    config: UpstreamConfig,
}

impl HttpRemoteRegistry {
    pub fn new(config: UpstreamConfig) -> ProxyResult<Self> {
        let parsed = Url::parse(&config.url).map_err(|e| {
            ProxyError::Internal(format!("invalid upstream url '{}': {e}", config.url))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProxyError::Internal(format!(
                "upstream url '{}' must use http or https",
                config.url
            )));
        }

        let client = Client::builder()
            .connect_timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn ensure_enabled(&self) -> ProxyResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(ProxyError::NotFound(
                "Upstream registry lookup is disabled in configuration".to_string(),
            ))
        }
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{repository}/manifests/{reference}", self.base_url)
    }

    fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{repository}/blobs/{digest}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> ProxyResult<Response> {
        request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Upstream request failed");
            ProxyError::Upstream(format!("request to {url} failed: {e}"))
        })
    }
}

#[async_trait]
impl RemoteRegistry for HttpRemoteRegistry {
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> ProxyResult<Option<Descriptor>> {
        self.ensure_enabled()?;
        let url = self.manifest_url(repository, reference);
        debug!(url = %url, "Checking upstream manifest");

        let request = self
            .client
            .head(&url)
            .header(ACCEPT, manifest_accept())
            .timeout(self.config.timeout());
        let response = self.send(request, &url).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(repository = %repository, reference = %reference, "Manifest absent upstream");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ProxyError::from_upstream_status(
                status.as_u16(),
                &format!("manifest {repository}:{reference}"),
            ));
        }

        let headers = response.headers();
        let digest = match header_str(headers, DIGEST_HEADER) {
            Some(digest) => digest.to_string(),
            None if is_digest(reference) => reference.to_string(),
            None => {
                // Some registries omit the digest on HEAD; fetch to compute it
                debug!(repository = %repository, reference = %reference, "No digest header, fetching manifest");
                return self
                    .manifest(repository, reference)
                    .await
                    .map(|m| Some(m.descriptor()));
            }
        };

        Ok(Some(Descriptor {
            digest,
            media_type: media_type(headers),
            size: header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }))
    }

    async fn manifest(&self, repository: &str, reference: &str) -> ProxyResult<Manifest> {
        self.ensure_enabled()?;
        let url = self.manifest_url(repository, reference);
        debug!(url = %url, "Fetching upstream manifest");

        let request = self
            .client
            .get(&url)
            .header(ACCEPT, manifest_accept())
            .timeout(self.config.timeout());
        let response = self.send(request, &url).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::from_upstream_status(
                status.as_u16(),
                &format!("manifest {repository}:{reference}"),
            ));
        }

        let media_type = media_type(response.headers());
        let announced = header_str(response.headers(), DIGEST_HEADER).map(str::to_string);
        let payload = response.bytes().await.map_err(|e| {
            ProxyError::Upstream(format!("Failed to read manifest {repository}:{reference}: {e}"))
        })?;

        let manifest = Manifest::parse(&media_type, payload)?;
        let actual = manifest.digest();
        if let Some(announced) = announced.filter(|d| d.starts_with("sha256:")) {
            if announced != actual {
                return Err(ProxyError::Upstream(format!(
                    "manifest {repository}:{reference} digest mismatch: upstream announced {announced}, content is {actual}"
                )));
            }
        }

        info!(repository = %repository, reference = %reference, digest = %actual, "Fetched manifest from upstream");
        Ok(manifest)
    }

    async fn blob_reader(&self, repository: &str, digest: &str) -> ProxyResult<(u64, BlobStream)> {
        self.ensure_enabled()?;
        let url = self.blob_url(repository, digest);
        debug!(url = %url, "Opening upstream blob");

        let response = self.send(self.client.get(&url), &url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::from_upstream_status(
                status.as_u16(),
                &format!("blob {repository}@{digest}"),
            ));
        }

        let size = response.content_length().unwrap_or(0);
        let stream = response.bytes_stream().map_err(io::Error::other);
        info!(repository = %repository, digest = %digest, size, "Streaming blob from upstream");

        Ok((size, Box::pin(stream)))
    }
}

fn manifest_accept() -> String {
    [
        MEDIA_TYPE_MANIFEST_LIST,
        MEDIA_TYPE_MANIFEST_V2,
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_OCI_MANIFEST,
    ]
    .join(", ")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Content type without parameters
fn media_type(headers: &HeaderMap) -> String {
    header_str(headers, CONTENT_TYPE.as_str())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

//! Pull operations behind the CLI commands
//!
//! Each operation goes through the proxy controller exactly like a registry
//! request would: ask where the content is served from, then read it from
//! the local store or stream it from upstream while it is cached.

use crate::app::App;
use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use pullcache_core::{is_digest, resolve_reference, ArtifactInfo, CacheOutcome, Manifest};
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Upstream,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local => write!(f, "local cache"),
            Source::Upstream => write!(f, "upstream"),
        }
    }
}

pub struct ManifestFetch {
    pub source: Source,
    pub manifest: Manifest,
    /// Background caching of an upstream manifest
    pub caching: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFetch {
    pub source: Source,
    pub bytes: u64,
    /// Outcome of the cache write started for this request, if any
    pub cache_write: Option<bool>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullSummary {
    pub manifests: usize,
    pub blobs_local: usize,
    pub blobs_fetched: usize,
}

/// Repository name as clients of the proxy project see it
pub fn qualify_repository(project: &str, repository: &str) -> String {
    let repository = repository.trim_matches('/');
    if repository.starts_with(&format!("{project}/")) {
        repository.to_string()
    } else {
        format!("{project}/{repository}")
    }
}

pub fn artifact(project: &str, repository: &str, reference: &str) -> ArtifactInfo {
    let repository = qualify_repository(project, repository);
    if is_digest(reference) {
        ArtifactInfo::with_digest(project, &repository, reference)
    } else {
        ArtifactInfo::with_tag(project, &repository, reference)
    }
}

pub async fn fetch_manifest(app: &App, art: &ArtifactInfo) -> Result<ManifestFetch> {
    let reference = resolve_reference(art);
    let outcome = app
        .controller
        .use_local_manifest(art, &app.remote)
        .await
        .with_context(|| format!("Failed to resolve manifest {}:{reference}", art.repository))?;

    match outcome {
        CacheOutcome::UseLocal => {
            let manifest = app
                .store
                .read_manifest(&art.repository, reference)
                .await
                .with_context(|| {
                    format!("Failed to read cached manifest {}:{reference}", art.repository)
                })?;
            Ok(ManifestFetch {
                source: Source::Local,
                manifest,
                caching: None,
            })
        }
        CacheOutcome::FetchRemote(desc) => {
            debug!(digest = %desc.digest, media_type = %desc.media_type, "Fetching manifest from upstream");
            let proxied = app
                .controller
                .proxy_manifest(art, &app.remote)
                .await
                .with_context(|| {
                    format!("Failed to fetch manifest {}:{reference}", art.repository)
                })?;
            Ok(ManifestFetch {
                source: Source::Upstream,
                manifest: proxied.manifest,
                caching: Some(proxied.caching),
            })
        }
    }
}

/// Copy a blob to `out`, caching it when it comes from upstream
pub async fn fetch_blob<W>(app: &App, art: &ArtifactInfo, out: &mut W) -> Result<BlobFetch>
where
    W: AsyncWrite + Unpin,
{
    ensure_digest(&art.digest)?;

    let (source, mut stream, cache_write) = if app.controller.use_local_blob(art).await {
        let (_, stream) = app
            .store
            .open_blob(&art.digest)
            .await
            .with_context(|| format!("Failed to open cached blob {}", art.digest))?;
        (Source::Local, stream, None)
    } else {
        let blob = app
            .controller
            .proxy_blob(art, &app.remote)
            .await
            .with_context(|| format!("Failed to fetch blob {}", art.digest))?;
        (Source::Upstream, blob.stream, blob.cache_write)
    };

    let mut bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Failed to read blob {}", art.digest))?;
        out.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    out.flush().await?;
    drop(stream);

    let cache_write = match cache_write {
        Some(handle) => Some(handle.await.context("Blob cache task panicked")?),
        None => None,
    };
    if cache_write == Some(false) {
        warn!(digest = %art.digest, "Blob was served but not cached");
    }

    Ok(BlobFetch {
        source,
        bytes,
        cache_write,
    })
}

/// Pull a manifest and everything it references into the local store.
///
/// Image indexes are followed into every child manifest. Blobs are read to
/// completion and discarded, which is enough for the tee to cache them.
pub async fn pull(app: &App, art: ArtifactInfo) -> Result<PullSummary> {
    let mut summary = PullSummary::default();
    let mut pending = vec![art];

    while let Some(art) = pending.pop() {
        let fetch = fetch_manifest(app, &art).await?;
        summary.manifests += 1;
        info!(
            repository = %art.repository,
            reference = %resolve_reference(&art),
            source = %fetch.source,
            "Pulled manifest"
        );

        if fetch.manifest.is_index() {
            pending.extend(fetch.manifest.references.iter().map(|child| {
                ArtifactInfo::with_digest(&art.project_name, &art.repository, &child.digest)
            }));
        } else {
            let mut sink = tokio::io::sink();
            for desc in &fetch.manifest.references {
                let blob = ArtifactInfo::with_digest(&art.project_name, &art.repository, &desc.digest);
                let fetched = fetch_blob(app, &blob, &mut sink).await?;
                match fetched.source {
                    Source::Local => summary.blobs_local += 1,
                    Source::Upstream => summary.blobs_fetched += 1,
                }
            }
        }

        if let Some(caching) = fetch.caching {
            caching.await.context("Manifest cache task panicked")?;
        }
    }

    Ok(summary)
}

/// Remove uploads left behind by interrupted blob writes
pub async fn clean(app: &App) -> Result<usize> {
    let removed = app
        .store
        .remove_partial_uploads()
        .await
        .context("Failed to remove partial uploads")?;
    if removed == 0 {
        debug!("No partial uploads to remove");
    }
    Ok(removed)
}

pub fn ensure_digest(reference: &str) -> Result<()> {
    if !is_digest(reference) {
        bail!("'{reference}' is not a content digest (expected sha256:<hex>)");
    }
    Ok(())
}

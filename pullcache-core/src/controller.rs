//! # Proxy Controller
//!
//! Decides, per pull request, whether content is served from the local store
//! or fetched from the upstream registry of the proxy project, and drives the
//! fetch-and-cache path when upstream wins.
//!
//! ## Manifests
//!
//! - digest requests are answered from the cache whenever it has the digest,
//!   without asking upstream
//! - tag requests always ask upstream first, tags move
//! - upstream "does not exist" is authoritative: `NotFound`, even if a stale
//!   copy is cached (the stale tag is removed in the background)
//! - upstream rate limiting falls back to the cached copy when there is one
//!
//! ## Blobs
//!
//! Blobs are content-addressed, so a local hit is always valid. On a miss the
//! upstream stream is teed: the client reads one side while a background task
//! writes the other into the local store.

use crate::config::ProxyConfig;
use crate::error::{ErrorKind, ProxyError, ProxyResult};
use crate::inflight::InflightBlobs;
use crate::ports::{BlobStream, LocalStore, RemoteRegistry};
use crate::reference::{resolve_reference, resolve_remote_repository};
use crate::tee::tee;
use crate::types::{ArtifactInfo, CacheOutcome, Descriptor, Manifest};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// A blob being served from upstream
pub struct ProxiedBlob {
    /// Size reported by upstream
    pub size: u64,
    /// Stream for the client response
    pub stream: BlobStream,
    /// Background cache write; resolves to whether the blob was stored.
    /// `None` when no cache write was started for this request.
    pub cache_write: Option<JoinHandle<bool>>,
}

/// A manifest fetched from upstream
pub struct ProxiedManifest {
    pub manifest: Manifest,
    /// Background task storing the manifest locally and sending the pull event
    pub caching: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ProxyController {
    local: Arc<dyn LocalStore>,
    config: Arc<ProxyConfig>,
    inflight: InflightBlobs,
}

impl ProxyController {
    pub fn new(local: Arc<dyn LocalStore>, config: ProxyConfig) -> Self {
        Self {
            local,
            config: Arc::new(config),
            inflight: InflightBlobs::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Blobs whose cache write is currently running
    pub fn inflight(&self) -> &InflightBlobs {
        &self.inflight
    }

    /// Decide where a manifest request is served from.
    ///
    /// Returns [`CacheOutcome::FetchRemote`] with the upstream descriptor when
    /// the caller should fetch fresh content, [`CacheOutcome::UseLocal`] when
    /// the cached copy is to be served.
    #[instrument(skip_all, fields(repository = %art.repository, reference = %resolve_reference(art)))]
    pub async fn use_local_manifest(
        &self,
        art: &ArtifactInfo,
        remote: &dyn RemoteRegistry,
    ) -> ProxyResult<CacheOutcome> {
        art.validate()?;

        let mut local_checked = false;
        if art.is_digest_addressed() {
            if self.has_cached_manifest(art).await {
                debug!("Digest found in local cache");
                return Ok(CacheOutcome::UseLocal);
            }
            local_checked = true;
        }

        let remote_repo = resolve_remote_repository(art);
        let reference = resolve_reference(art);

        match remote.manifest_exist(remote_repo, reference).await {
            Ok(Some(desc)) => {
                debug!(digest = %desc.digest, "Manifest found upstream");
                Ok(CacheOutcome::FetchRemote(desc))
            }
            Ok(None) => {
                if !art.is_digest_addressed() && self.has_cached_manifest(art).await {
                    info!("Tag no longer exists upstream, removing stale local copy");
                    self.spawn_delete(&art.repository, &art.tag);
                }
                Err(ProxyError::NotFound(format!(
                    "manifest {remote_repo}:{reference} not found upstream"
                )))
            }
            Err(err) if err.kind() == ErrorKind::RateLimit => {
                if !local_checked && self.has_cached_manifest(art).await {
                    warn!(error = %err, "Upstream rate limited, serving cached manifest");
                    return Ok(CacheOutcome::UseLocal);
                }
                warn!(error = %err, "Upstream rate limited and no cached manifest");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Whether a blob request can be served from the local store.
    ///
    /// Never contacts upstream. A failing store lookup counts as a miss.
    #[instrument(skip_all, fields(repository = %art.repository, digest = %art.digest))]
    pub async fn use_local_blob(&self, art: &ArtifactInfo) -> bool {
        if art.digest.is_empty() {
            return false;
        }

        match self.local.blob_exist(art).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(error = %e, "Local blob lookup failed, treating as a miss");
                false
            }
        }
    }

    /// Stream a blob from upstream while caching it locally.
    ///
    /// The returned stream delivers the whole blob to the client even if the
    /// cache write fails. Only the first of several concurrent requests for
    /// the same digest writes the cache when deduplication is enabled.
    #[instrument(skip_all, fields(repository = %art.repository, digest = %art.digest))]
    pub async fn proxy_blob(
        &self,
        art: &ArtifactInfo,
        remote: &dyn RemoteRegistry,
    ) -> ProxyResult<ProxiedBlob> {
        if art.digest.is_empty() {
            return Err(ProxyError::InvalidArtifact(format!(
                "blob request for {} has no digest",
                art.repository
            )));
        }

        let remote_repo = resolve_remote_repository(art);
        let (size, upstream) = remote.blob_reader(remote_repo, &art.digest).await?;

        let guard = if self.config.dedupe_inflight_blobs {
            match self.inflight.try_acquire(&art.digest) {
                Some(guard) => Some(guard),
                None => {
                    debug!("Blob is already being cached, streaming without caching");
                    return Ok(ProxiedBlob {
                        size,
                        stream: upstream,
                        cache_write: None,
                    });
                }
            }
        } else {
            None
        };

        let desc = Descriptor {
            digest: art.digest.clone(),
            media_type: String::new(),
            size,
        };
        let streams = tee(upstream, self.config.stream_buffer_chunks);
        let cache = streams.cache;
        let session = streams.session;
        let local = Arc::clone(&self.local);
        let repository = art.repository.clone();

        let cache_write = tokio::spawn(async move {
            let _guard = guard;
            let pushed = match local
                .push_blob(&repository, &desc, cache.into_blob_stream())
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        repository = %repository,
                        digest = %desc.digest,
                        error = %e,
                        "Failed to cache blob, client stream unaffected"
                    );
                    false
                }
            };

            match session.finish().await {
                Ok(report) => debug!(
                    digest = %desc.digest,
                    bytes = report.bytes,
                    outcome = ?report.outcome,
                    "Blob stream closed"
                ),
                Err(e) => warn!(digest = %desc.digest, error = %e, "Blob stream ended abnormally"),
            }

            if pushed {
                info!(repository = %repository, digest = %desc.digest, size = desc.size, "Blob cached");
            }
            pushed
        }
        .in_current_span());

        Ok(ProxiedBlob {
            size,
            stream: streams.client.into_blob_stream(),
            cache_write: Some(cache_write),
        })
    }

    /// Fetch a manifest from upstream and cache it in the background.
    ///
    /// The manifest is returned as soon as upstream answers. Caching waits
    /// for the manifest's blobs to reach the local store first, so a cached
    /// manifest never references missing content.
    #[instrument(skip_all, fields(repository = %art.repository, reference = %resolve_reference(art)))]
    pub async fn proxy_manifest(
        &self,
        art: &ArtifactInfo,
        remote: &dyn RemoteRegistry,
    ) -> ProxyResult<ProxiedManifest> {
        art.validate()?;

        let remote_repo = resolve_remote_repository(art);
        let reference = resolve_reference(art);

        let manifest = match remote.manifest(remote_repo, reference).await {
            Ok(manifest) => manifest,
            Err(err) => {
                if err.is_not_found() && !art.is_digest_addressed() {
                    self.spawn_delete(&art.repository, &art.tag);
                }
                return Err(err);
            }
        };

        let caching = tokio::spawn(
            cache_manifest(
                Arc::clone(&self.local),
                Arc::clone(&self.config),
                art.clone(),
                manifest.clone(),
            )
            .in_current_span(),
        );

        Ok(ProxiedManifest { manifest, caching })
    }

    async fn has_cached_manifest(&self, art: &ArtifactInfo) -> bool {
        match self.local.get_manifest(art).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(error = %e, "Local manifest lookup failed, treating as a miss");
                false
            }
        }
    }

    fn spawn_delete(&self, repository: &str, reference: &str) {
        let local = Arc::clone(&self.local);
        let repository = repository.to_string();
        let reference = reference.to_string();
        tokio::spawn(
            async move {
                local.delete_manifest(&repository, &reference).await;
            }
            .in_current_span(),
        );
    }
}

async fn cache_manifest(
    local: Arc<dyn LocalStore>,
    config: Arc<ProxyConfig>,
    art: ArtifactInfo,
    manifest: Manifest,
) {
    let cached = match local.get_manifest(&art).await {
        Ok(found) => found,
        Err(e) => {
            warn!(repository = %art.repository, error = %e, "Local manifest lookup failed");
            None
        }
    };

    let needs_push = match cached {
        None => true,
        Some(_) if art.is_digest_addressed() => false,
        Some(_) => match local
            .same_artifact(&art.repository, &art.tag, &manifest.digest())
            .await
        {
            Ok(same) => !same,
            Err(e) => {
                warn!(repository = %art.repository, tag = %art.tag, error = %e, "Tag comparison failed");
                true
            }
        },
    };

    if needs_push && !wait_and_push_manifest(local.as_ref(), &config, &art, &manifest).await {
        return;
    }

    local.send_pull_event(&art.repository, resolve_reference(&art));
}

/// Push `manifest` once every blob it references is cached.
///
/// Manifest lists go in immediately; their children are cached by their own
/// pulls. Returns whether the manifest was stored.
async fn wait_and_push_manifest(
    local: &dyn LocalStore,
    config: &ProxyConfig,
    art: &ArtifactInfo,
    manifest: &Manifest,
) -> bool {
    let reference = resolve_reference(art);

    if manifest.is_index() {
        return match local
            .push_manifest_list(&art.repository, reference, manifest)
            .await
        {
            Ok(()) => {
                info!(repository = %art.repository, reference = %reference, "Manifest list cached");
                true
            }
            Err(e) => {
                error!(repository = %art.repository, reference = %reference, error = %e, "Failed to cache manifest list");
                false
            }
        };
    }

    let mut missing = local.check_dependencies(&art.repository, manifest).await;
    let mut attempts = 0;
    while !missing.is_empty() && attempts < config.manifest_wait_attempts {
        debug!(
            repository = %art.repository,
            missing = missing.len(),
            attempt = attempts + 1,
            "Waiting for manifest dependencies"
        );
        tokio::time::sleep(config.manifest_wait_interval()).await;
        missing = local.check_dependencies(&art.repository, manifest).await;
        attempts += 1;
    }

    if let Some(first) = missing.first() {
        error!(
            repository = %art.repository,
            reference = %reference,
            missing = missing.len(),
            first_missing = %first.digest,
            "Manifest dependencies never arrived, not caching manifest"
        );
        return false;
    }

    match local.push_manifest(&art.repository, reference, manifest).await {
        Ok(()) => {
            info!(repository = %art.repository, reference = %reference, "Manifest cached");
            true
        }
        Err(e) => {
            error!(repository = %art.repository, reference = %reference, error = %e, "Failed to cache manifest");
            false
        }
    }
}

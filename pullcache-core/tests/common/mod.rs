//! Common test utilities and helpers
//!
//! Hand-written mocks of the two ports plus an instrumented upstream stream.
//! Every mock counts its calls so tests can assert which side was consulted.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use pullcache_core::{
    Artifact, ArtifactInfo, BlobStream, Descriptor, LocalStore, Manifest, ProxyConfig, ProxyError,
    ProxyResult, RemoteRegistry,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

pub const PROJECT: &str = "dockerhub_proxy";
pub const REPOSITORY: &str = "dockerhub_proxy/library/alpine";
pub const UPSTREAM_REPOSITORY: &str = "library/alpine";

/// Config with short dependency polling so manifest tests finish quickly
pub fn fast_config() -> ProxyConfig {
    ProxyConfig {
        stream_buffer_chunks: 2,
        manifest_wait_attempts: 3,
        manifest_wait_interval_ms: 10,
        ..Default::default()
    }
}

pub fn tag_request(tag: &str) -> ArtifactInfo {
    ArtifactInfo::with_tag(PROJECT, REPOSITORY, tag)
}

pub fn digest_request(digest: &str) -> ArtifactInfo {
    ArtifactInfo::with_digest(PROJECT, REPOSITORY, digest)
}

/// Image manifest referencing a config blob and the given layers
pub fn image_manifest(config: &str, layers: &[&str]) -> Manifest {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 1024,
                "digest": digest,
            })
        })
        .collect();
    let doc = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1024,
            "digest": config,
        },
        "layers": layers,
    });
    Manifest::parse("", Bytes::from(doc.to_string())).unwrap()
}

/// Manifest list pointing at the given child manifests
pub fn index_manifest(children: &[&str]) -> Manifest {
    let manifests: Vec<_> = children
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 528,
                "digest": digest,
            })
        })
        .collect();
    let doc = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": manifests,
    });
    Manifest::parse("", Bytes::from(doc.to_string())).unwrap()
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// Poll `check` until it holds, for up to about a second
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn read_all(mut stream: BlobStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Counters shared between a [`ChunkedSource`] and the test
#[derive(Clone, Default)]
pub struct SourceProbe {
    pulled: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

impl SourceProbe {
    /// Chunks handed out so far
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

/// Upstream stream that hands out `data` in fixed-size chunks
pub struct ChunkedSource {
    data: Bytes,
    chunk_size: usize,
    offset: usize,
    fail_after: Option<usize>,
    hold_open: bool,
    probe: SourceProbe,
}

impl ChunkedSource {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
            offset: 0,
            fail_after: None,
            hold_open: false,
            probe: SourceProbe::default(),
        }
    }

    /// Fail with a connection reset after `chunks` chunks
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Never end once the data is exhausted
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }

    pub fn boxed(self) -> BlobStream {
        Box::pin(self)
    }
}

impl Stream for ChunkedSource {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(limit) = self.fail_after {
            if self.probe.pulled() >= limit {
                return Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "upstream connection reset",
                ))));
            }
        }

        if self.offset >= self.data.len() {
            return if self.hold_open {
                Poll::Pending
            } else {
                Poll::Ready(None)
            };
        }

        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        self.probe.pulled.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Some(Ok(chunk)))
    }
}

impl Drop for ChunkedSource {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory local store recording every call
#[derive(Default)]
pub struct MockLocalStore {
    tags: Mutex<HashMap<(String, String), String>>,
    manifests: Mutex<HashSet<(String, String)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pending_dependency_checks: AtomicUsize,
    pub fail_lookups: AtomicBool,
    pub fail_push_blob: AtomicBool,
    pub get_manifest_calls: AtomicUsize,
    pub blob_exist_calls: AtomicUsize,
    pub check_dependencies_calls: AtomicUsize,
    pub pushed_manifests: Mutex<Vec<(String, String, String)>>,
    pub pushed_lists: Mutex<Vec<(String, String, String)>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub pull_events: Mutex<Vec<(String, String)>>,
}

impl MockLocalStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cache_tag(&self, repository: &str, tag: &str, digest: &str) {
        self.tags
            .lock()
            .unwrap()
            .insert((repository.to_string(), tag.to_string()), digest.to_string());
        self.cache_digest(repository, digest);
    }

    pub fn cache_digest(&self, repository: &str, digest: &str) {
        self.manifests
            .lock()
            .unwrap()
            .insert((repository.to_string(), digest.to_string()));
    }

    pub fn cache_blob(&self, digest: &str, data: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), data.to_vec());
    }

    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }

    pub fn tag_digest(&self, repository: &str, tag: &str) -> Option<String> {
        self.tags
            .lock()
            .unwrap()
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
    }

    /// Report every reference as missing for the next `n` dependency checks
    pub fn set_pending_dependency_checks(&self, n: usize) {
        self.pending_dependency_checks.store(n, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn lookup_failure(&self) -> ProxyResult<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(ProxyError::Internal("database unavailable".to_string()));
        }
        Ok(())
    }

    fn store_manifest(&self, repository: &str, reference: &str, manifest: &Manifest) -> String {
        let digest = manifest.digest();
        if !pullcache_core::is_digest(reference) {
            self.tags
                .lock()
                .unwrap()
                .insert((repository.to_string(), reference.to_string()), digest.clone());
        }
        self.cache_digest(repository, &digest);
        digest
    }
}

#[async_trait]
impl LocalStore for MockLocalStore {
    async fn get_manifest(&self, art: &ArtifactInfo) -> ProxyResult<Option<Artifact>> {
        self.get_manifest_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup_failure()?;

        let digest = if art.is_digest_addressed() {
            let key = (art.repository.clone(), art.digest.clone());
            self.manifests
                .lock()
                .unwrap()
                .contains(&key)
                .then(|| art.digest.clone())
        } else {
            self.tag_digest(&art.repository, &art.tag)
        };

        Ok(digest.map(|digest| Artifact {
            repository: art.repository.clone(),
            digest,
            media_type: String::new(),
            size: 0,
        }))
    }

    async fn blob_exist(&self, art: &ArtifactInfo) -> ProxyResult<bool> {
        self.blob_exist_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup_failure()?;
        Ok(self.blobs.lock().unwrap().contains_key(&art.digest))
    }

    async fn push_blob(
        &self,
        _repository: &str,
        desc: &Descriptor,
        mut blob: BlobStream,
    ) -> ProxyResult<()> {
        if self.fail_push_blob.load(Ordering::SeqCst) {
            return Err(ProxyError::Internal("disk full".to_string()));
        }

        let mut data = Vec::new();
        while let Some(chunk) = blob.next().await {
            data.extend_from_slice(&chunk?);
        }
        self.cache_blob(&desc.digest, &data);
        Ok(())
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()> {
        let digest = self.store_manifest(repository, reference, manifest);
        self.pushed_manifests.lock().unwrap().push((
            repository.to_string(),
            reference.to_string(),
            digest,
        ));
        Ok(())
    }

    async fn push_manifest_list(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()> {
        let digest = self.store_manifest(repository, reference, manifest);
        self.pushed_lists.lock().unwrap().push((
            repository.to_string(),
            reference.to_string(),
            digest,
        ));
        Ok(())
    }

    async fn check_dependencies(&self, _repository: &str, manifest: &Manifest) -> Vec<Descriptor> {
        self.check_dependencies_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .pending_dependency_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending {
            return manifest.references.clone();
        }

        let blobs = self.blobs.lock().unwrap();
        manifest
            .references
            .iter()
            .filter(|desc| !blobs.contains_key(&desc.digest))
            .cloned()
            .collect()
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) {
        self.tags
            .lock()
            .unwrap()
            .remove(&(repository.to_string(), reference.to_string()));
        self.deleted
            .lock()
            .unwrap()
            .push((repository.to_string(), reference.to_string()));
    }

    async fn same_artifact(&self, repository: &str, tag: &str, digest: &str) -> ProxyResult<bool> {
        Ok(self.tag_digest(repository, tag).as_deref() == Some(digest))
    }

    fn send_pull_event(&self, repository: &str, tag: &str) {
        self.pull_events
            .lock()
            .unwrap()
            .push((repository.to_string(), tag.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    Available,
    RateLimited,
    Unavailable,
}

/// Upstream registry backed by in-memory manifests and blobs
pub struct MockRemoteRegistry {
    manifests: Mutex<HashMap<(String, String), Manifest>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    mode: Mutex<RemoteMode>,
    chunk_size: usize,
    stall_blobs: bool,
    pub exist_calls: AtomicUsize,
    pub manifest_calls: AtomicUsize,
    pub blob_calls: AtomicUsize,
    pub requested_repositories: Mutex<Vec<String>>,
    pub probes: Mutex<Vec<SourceProbe>>,
}

impl Default for MockRemoteRegistry {
    fn default() -> Self {
        Self {
            manifests: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            mode: Mutex::new(RemoteMode::Available),
            chunk_size: 1024,
            stall_blobs: false,
            exist_calls: AtomicUsize::new(0),
            manifest_calls: AtomicUsize::new(0),
            blob_calls: AtomicUsize::new(0),
            requested_repositories: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
        }
    }
}

impl MockRemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `manifest` under `reference` and under its own digest
    pub fn with_manifest(self, repository: &str, reference: &str, manifest: Manifest) -> Self {
        {
            let mut manifests = self.manifests.lock().unwrap();
            manifests.insert(
                (repository.to_string(), manifest.digest()),
                manifest.clone(),
            );
            manifests.insert((repository.to_string(), reference.to_string()), manifest);
        }
        self
    }

    pub fn with_blob(self, digest: &str, data: Bytes) -> Self {
        self.blobs.lock().unwrap().insert(digest.to_string(), data);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Keep blob streams open after their data instead of ending them
    pub fn with_stalled_blobs(mut self) -> Self {
        self.stall_blobs = true;
        self
    }

    pub fn set_mode(&self, mode: RemoteMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn check_mode(&self, repository: &str) -> ProxyResult<()> {
        self.requested_repositories
            .lock()
            .unwrap()
            .push(repository.to_string());
        match *self.mode.lock().unwrap() {
            RemoteMode::Available => Ok(()),
            RemoteMode::RateLimited => Err(ProxyError::from_upstream_status(
                429,
                "toomanyrequests: pull rate limit exceeded",
            )),
            RemoteMode::Unavailable => {
                Err(ProxyError::Upstream("connection refused".to_string()))
            }
        }
    }

    fn find_manifest(&self, repository: &str, reference: &str) -> Option<Manifest> {
        self.manifests
            .lock()
            .unwrap()
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RemoteRegistry for MockRemoteRegistry {
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> ProxyResult<Option<Descriptor>> {
        self.exist_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mode(repository)?;
        Ok(self
            .find_manifest(repository, reference)
            .map(|m| m.descriptor()))
    }

    async fn manifest(&self, repository: &str, reference: &str) -> ProxyResult<Manifest> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mode(repository)?;
        self.find_manifest(repository, reference).ok_or_else(|| {
            ProxyError::NotFound(format!("manifest {repository}:{reference} unknown"))
        })
    }

    async fn blob_reader(&self, repository: &str, digest: &str) -> ProxyResult<(u64, BlobStream)> {
        self.blob_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mode(repository)?;
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("blob {digest} unknown")))?;

        let size = data.len() as u64;
        let mut source = ChunkedSource::new(data, self.chunk_size);
        if self.stall_blobs {
            source = source.held_open();
        }
        self.probes.lock().unwrap().push(source.probe());
        Ok((size, source.boxed()))
    }
}

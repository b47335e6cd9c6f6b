//! # Storage and Upstream Ports
//!
//! The proxy controller never talks to a concrete store or registry client.
//! It consumes two capability traits instead:
//!
//! ```text
//! ProxyController
//!     ├── LocalStore      (cached manifests and blobs)
//!     └── RemoteRegistry  (the upstream registry of the proxy project)
//! ```
//!
//! Implementations must be `Send + Sync`; one store instance is shared by
//! every request. Writes of the same content-addressed digest may race and
//! must be idempotent: a repeated write of identical content is a no-op.

use crate::error::ProxyResult;
use crate::types::{Artifact, ArtifactInfo, Descriptor, Manifest};
use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;

/// Byte stream of a blob, read chunk by chunk
pub type BlobStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Local cache of manifests and blobs.
#[async_trait::async_trait]
pub trait LocalStore: Send + Sync {
    /// Cached manifest for the artifact's tag or digest, `None` on a miss
    async fn get_manifest(&self, art: &ArtifactInfo) -> ProxyResult<Option<Artifact>>;

    /// Whether the blob named by `art.digest` is cached
    async fn blob_exist(&self, art: &ArtifactInfo) -> ProxyResult<bool>;

    /// Store a blob from `blob`.
    ///
    /// The stream yields an error if the upstream copy was abandoned part way;
    /// nothing may be committed in that case.
    async fn push_blob(
        &self,
        repository: &str,
        desc: &Descriptor,
        blob: BlobStream,
    ) -> ProxyResult<()>;

    /// Store an image manifest under `reference` (tag or digest)
    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()>;

    /// Store a manifest list / image index under `reference`
    async fn push_manifest_list(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()>;

    /// Descriptors referenced by `manifest` that are not cached yet
    async fn check_dependencies(&self, repository: &str, manifest: &Manifest) -> Vec<Descriptor>;

    /// Remove a manifest or tag. Failures are logged by the implementation.
    async fn delete_manifest(&self, repository: &str, reference: &str);

    /// Whether `tag` currently points at `digest` in the local store
    async fn same_artifact(&self, repository: &str, tag: &str, digest: &str) -> ProxyResult<bool>;

    /// Record a pull of `reference` (the tag, or the digest for digest pulls).
    /// Must not block and must not fail the caller.
    fn send_pull_event(&self, repository: &str, reference: &str);
}

/// Upstream registry a proxy project mirrors.
///
/// Repositories passed in are upstream paths, already stripped of the proxy
/// project prefix.
#[async_trait::async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// Descriptor of the manifest if upstream has it, `None` if it does not
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> ProxyResult<Option<Descriptor>>;

    /// Fetch a manifest
    async fn manifest(&self, repository: &str, reference: &str) -> ProxyResult<Manifest>;

    /// Open a blob for streaming; returns its size and the byte stream
    async fn blob_reader(&self, repository: &str, digest: &str) -> ProxyResult<(u64, BlobStream)>;
}

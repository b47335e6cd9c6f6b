//! # Filesystem Local Store
//!
//! [`FsLocalStore`] keeps cached manifests and blobs in a directory tree (see
//! [`crate::paths`] for the layout).
//!
//! Blob writes stream into a uniquely named file under `uploads/` while the
//! content is hashed, and are renamed into `blobs/` only once the digest (and
//! size, when known) matches. A stream that ends in an error, or content that
//! does not match, leaves nothing behind. Writing a digest that is already
//! present is a no-op, so concurrent writers of the same blob cannot conflict.
//!
//! Writes and deletes run under shared access; [`FsLocalStore::with_exclusive_access`]
//! lets maintenance work such as [`FsLocalStore::remove_partial_uploads`] run
//! with no write in progress.

use crate::paths::{validate_repository, validate_tag, ParsedDigest, StoreLayout};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use pullcache_core::{
    is_digest, Artifact, ArtifactInfo, BlobStream, Descriptor, EventSender, ExclusiveAccess,
    LocalStore, Manifest, ProxyError, ProxyResult, RegistryEvent,
};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub struct FsLocalStore {
    layout: StoreLayout,
    access: ExclusiveAccess,
    events: Option<EventSender>,
}

impl FsLocalStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> ProxyResult<Self> {
        let layout = StoreLayout::new(root);
        for dir in [
            layout.blobs_dir(),
            layout.repositories_dir(),
            layout.uploads_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        debug!(root = %layout.root().display(), "Opened filesystem store");

        Ok(Self {
            layout,
            access: ExclusiveAccess::new(),
            events: None,
        })
    }

    /// Emit pull and delete events through `events`
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Run `f` with no write or delete in progress
    pub async fn with_exclusive_access<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.access.with_exclusive_access(f).await
    }

    /// Delete upload files left behind by a crash. Returns how many were removed.
    pub async fn remove_partial_uploads(&self) -> ProxyResult<usize> {
        self.with_exclusive_access(|| async {
            let mut removed = 0;
            let mut entries = fs::read_dir(self.layout.uploads_dir()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
            if removed > 0 {
                info!(removed, "Removed partial uploads");
            }
            Ok::<_, ProxyError>(removed)
        })
        .await
    }

    /// Open a cached blob for streaming; returns its size and content
    pub async fn open_blob(&self, digest: &str) -> ProxyResult<(u64, BlobStream)> {
        let parsed = ParsedDigest::parse(digest)?;
        let path = self.layout.blob_path(&parsed);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProxyError::NotFound(format!("blob {digest} not cached")))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        let stream = futures_util::stream::try_unfold(file, |mut file| async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, io::Error>(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), file)))
        });

        Ok((size, Box::pin(stream)))
    }

    /// Read a cached manifest by tag or digest
    pub async fn read_manifest(&self, repository: &str, reference: &str) -> ProxyResult<Manifest> {
        validate_repository(repository)?;
        let digest = match self.resolve(repository, reference).await? {
            Some(digest) => digest,
            None => {
                return Err(ProxyError::NotFound(format!(
                    "manifest {repository}:{reference} not cached"
                )))
            }
        };

        let payload = read_optional(&self.layout.manifest_path(repository, &digest))
            .await?
            .ok_or_else(|| {
                ProxyError::NotFound(format!("manifest {repository}:{reference} not cached"))
            })?;
        let media_type = read_optional(&self.layout.media_type_path(repository, &digest))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).trim().to_string())
            .unwrap_or_default();

        Manifest::parse(&media_type, Bytes::from(payload))
    }

    /// Digest a tag or digest reference points at, if the manifest is cached
    async fn resolve(&self, repository: &str, reference: &str) -> ProxyResult<Option<ParsedDigest>> {
        let digest = if is_digest(reference) {
            ParsedDigest::parse(reference)?
        } else {
            match self.tag_target(repository, reference).await? {
                Some(digest) => digest,
                None => return Ok(None),
            }
        };

        if is_file(&self.layout.manifest_path(repository, &digest)).await {
            Ok(Some(digest))
        } else {
            Ok(None)
        }
    }

    async fn tag_target(&self, repository: &str, tag: &str) -> ProxyResult<Option<ParsedDigest>> {
        validate_tag(tag)?;
        match read_optional(&self.layout.tag_path(repository, tag)).await? {
            Some(raw) => {
                let link = String::from_utf8_lossy(&raw);
                ParsedDigest::parse(link.trim()).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn write_blob(&self, desc: &Descriptor, mut blob: BlobStream) -> ProxyResult<()> {
        let digest = ParsedDigest::parse(&desc.digest)?;
        let target = self.layout.blob_path(&digest);
        if is_file(&target).await {
            debug!(digest = %desc.digest, "Blob already cached");
            return Ok(());
        }

        let upload = self.layout.upload_path();
        let written = async {
            let mut file = fs::File::create(&upload).await?;
            let mut hasher = digest.algorithm.hasher();
            let mut size = 0u64;

            while let Some(chunk) = blob.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            file.sync_all().await?;

            let actual = hasher.finalize_digest();
            if actual != desc.digest {
                return Err(ProxyError::Upstream(format!(
                    "blob digest mismatch: expected {}, got {actual}",
                    desc.digest
                )));
            }
            if desc.size > 0 && size != desc.size {
                return Err(ProxyError::Upstream(format!(
                    "blob {} size mismatch: expected {}, got {size}",
                    desc.digest, desc.size
                )));
            }
            Ok::<_, ProxyError>(size)
        }
        .await;

        let size = match written {
            Ok(size) => size,
            Err(e) => {
                discard(&upload).await;
                return Err(e);
            }
        };

        commit(&upload, &target).await?;
        info!(digest = %desc.digest, size, "Blob stored");
        Ok(())
    }

    async fn write_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()> {
        validate_repository(repository)?;

        // A digest reference keys the manifest under its own algorithm
        let digest = if is_digest(reference) {
            let expected = ParsedDigest::parse(reference)?;
            let actual = expected.algorithm.digest_of(&manifest.payload);
            if actual != reference {
                return Err(ProxyError::InvalidArtifact(format!(
                    "manifest digest {actual} does not match reference {reference}"
                )));
            }
            expected
        } else {
            validate_tag(reference)?;
            ParsedDigest::parse(&manifest.digest())?
        };

        let manifest_path = self.layout.manifest_path(repository, &digest);
        if !is_file(&manifest_path).await {
            self.write_atomic(
                &self.layout.media_type_path(repository, &digest),
                manifest.media_type.as_bytes(),
            )
            .await?;
            self.write_atomic(&manifest_path, &manifest.payload).await?;
        }

        if !is_digest(reference) {
            self.write_atomic(
                &self.layout.tag_path(repository, reference),
                digest.as_digest().as_bytes(),
            )
            .await?;
        }

        Ok(())
    }

    async fn write_atomic(&self, target: &Path, content: &[u8]) -> ProxyResult<()> {
        let upload = self.layout.upload_path();
        if let Err(e) = fs::write(&upload, content).await {
            discard(&upload).await;
            return Err(e.into());
        }
        commit(&upload, target).await
    }

    async fn remove_manifest(&self, repository: &str, reference: &str) -> ProxyResult<bool> {
        validate_repository(repository)?;

        if !is_digest(reference) {
            validate_tag(reference)?;
            return remove_optional(&self.layout.tag_path(repository, reference)).await;
        }

        let digest = ParsedDigest::parse(reference)?;
        let removed = remove_optional(&self.layout.manifest_path(repository, &digest)).await?;
        remove_optional(&self.layout.media_type_path(repository, &digest)).await?;

        // Drop tags left pointing at the removed manifest
        let tags_dir = self.layout.tags_dir(repository);
        let mut entries = match fs::read_dir(&tags_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let link = fs::read_to_string(entry.path()).await?;
            if link.trim() == reference {
                remove_optional(&entry.path()).await?;
            }
        }

        Ok(removed)
    }

    fn emit(&self, event: RegistryEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn get_manifest(&self, art: &ArtifactInfo) -> ProxyResult<Option<Artifact>> {
        validate_repository(&art.repository)?;
        let reference = pullcache_core::resolve_reference(art);
        let Some(digest) = self.resolve(&art.repository, reference).await? else {
            return Ok(None);
        };

        let path = self.layout.manifest_path(&art.repository, &digest);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let media_type = read_optional(&self.layout.media_type_path(&art.repository, &digest))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).trim().to_string())
            .unwrap_or_default();

        Ok(Some(Artifact {
            repository: art.repository.clone(),
            digest: digest.as_digest(),
            media_type,
            size,
        }))
    }

    async fn blob_exist(&self, art: &ArtifactInfo) -> ProxyResult<bool> {
        let digest = ParsedDigest::parse(&art.digest)?;
        Ok(is_file(&self.layout.blob_path(&digest)).await)
    }

    async fn push_blob(
        &self,
        repository: &str,
        desc: &Descriptor,
        blob: BlobStream,
    ) -> ProxyResult<()> {
        self.access
            .with_shared_access(|| async {
                self.write_blob(desc, blob).await.map_err(|e| {
                    warn!(repository = %repository, digest = %desc.digest, error = %e, "Blob write discarded");
                    e
                })
            })
            .await
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()> {
        self.access
            .with_shared_access(|| self.write_manifest(repository, reference, manifest))
            .await?;
        info!(repository = %repository, reference = %reference, digest = %manifest.digest(), "Manifest stored");
        Ok(())
    }

    async fn push_manifest_list(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> ProxyResult<()> {
        if !manifest.is_index() {
            return Err(ProxyError::InvalidArtifact(format!(
                "{} is not a manifest list",
                manifest.media_type
            )));
        }
        self.access
            .with_shared_access(|| self.write_manifest(repository, reference, manifest))
            .await?;
        info!(
            repository = %repository,
            reference = %reference,
            children = manifest.references.len(),
            "Manifest list stored"
        );
        Ok(())
    }

    async fn check_dependencies(&self, repository: &str, manifest: &Manifest) -> Vec<Descriptor> {
        let mut missing = Vec::new();
        for desc in &manifest.references {
            let present = match ParsedDigest::parse(&desc.digest) {
                Ok(digest) if manifest.is_index() => {
                    is_file(&self.layout.manifest_path(repository, &digest)).await
                }
                Ok(digest) => is_file(&self.layout.blob_path(&digest)).await,
                Err(_) => false,
            };
            if !present {
                missing.push(desc.clone());
            }
        }
        missing
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) {
        let result = self
            .access
            .with_shared_access(|| self.remove_manifest(repository, reference))
            .await;

        match result {
            Ok(true) => {
                info!(repository = %repository, reference = %reference, "Manifest deleted");
                self.emit(RegistryEvent::delete(repository, reference));
            }
            Ok(false) => {
                debug!(repository = %repository, reference = %reference, "Nothing to delete");
            }
            Err(e) => {
                warn!(repository = %repository, reference = %reference, error = %e, "Failed to delete manifest");
            }
        }
    }

    async fn same_artifact(&self, repository: &str, tag: &str, digest: &str) -> ProxyResult<bool> {
        validate_repository(repository)?;
        Ok(self
            .tag_target(repository, tag)
            .await?
            .is_some_and(|target| target.as_digest() == digest))
    }

    fn send_pull_event(&self, repository: &str, reference: &str) {
        self.emit(RegistryEvent::pull(repository, reference));
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn read_optional(path: &Path) -> ProxyResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> ProxyResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Move a finished upload into place
async fn commit(upload: &Path, target: &Path) -> ProxyResult<()> {
    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            discard(upload).await;
            return Err(e.into());
        }
    }
    if let Err(e) = fs::rename(upload, target).await {
        discard(upload).await;
        return Err(e.into());
    }
    Ok(())
}

async fn discard(upload: &Path) {
    if let Err(e) = fs::remove_file(upload).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %upload.display(), error = %e, "Failed to remove upload file");
        }
    }
}

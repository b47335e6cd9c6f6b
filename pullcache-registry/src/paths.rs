//! On-disk layout of the filesystem store and validation of the names that
//! end up in its paths.
//!
//! ```text
//! <root>/
//! ├── blobs/<algorithm>/<hex>
//! ├── repositories/<repository>/
//! │   ├── manifests/<algorithm>/<hex>
//! │   ├── manifests/<algorithm>/<hex>.media-type
//! │   └── tags/<tag>                      (contains the manifest digest)
//! └── uploads/<uuid>                      (blob writes in progress)
//! ```
//!
//! Every repository, tag and digest is validated before it is joined onto the
//! root, so no request can address a path outside it.

use pullcache_core::{ProxyError, ProxyResult};
use sha2::{Digest, Sha256, Sha512};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    pub fn hasher(&self) -> ContentHasher {
        match self {
            DigestAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => ContentHasher::Sha512(Sha512::new()),
        }
    }

    /// `<algorithm>:<hex>` digest of `data`
    pub fn digest_of(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_digest()
    }
}

/// Incremental hash of streamed content
pub enum ContentHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Sha512(h) => h.update(data),
        }
    }

    /// Finish hashing and return `<algorithm>:<hex>`
    pub fn finalize_digest(self) -> String {
        match self {
            ContentHasher::Sha256(h) => format!("sha256:{:x}", h.finalize()),
            ContentHasher::Sha512(h) => format!("sha512:{:x}", h.finalize()),
        }
    }
}

/// A validated `<algorithm>:<hex>` digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl ParsedDigest {
    pub fn parse(digest: &str) -> ProxyResult<Self> {
        let invalid = || ProxyError::InvalidArtifact(format!("invalid digest '{digest}'"));

        let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
        let algorithm = match algorithm {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            other => {
                return Err(ProxyError::InvalidArtifact(format!(
                    "unsupported digest algorithm '{other}'"
                )))
            }
        };

        if hex.len() != algorithm.hex_len()
            || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid());
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    pub fn as_digest(&self) -> String {
        format!("{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Check a repository path such as `dockerhub_proxy/library/alpine`
pub fn validate_repository(repository: &str) -> ProxyResult<()> {
    let valid = !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component != "."
                && component != ".."
                && component
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });

    if valid {
        Ok(())
    } else {
        Err(ProxyError::InvalidArtifact(format!(
            "invalid repository name '{repository}'"
        )))
    }
}

/// Check a tag against the distribution tag grammar `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
pub fn validate_tag(tag: &str) -> ProxyResult<()> {
    let mut chars = tag.chars();
    let valid = tag.len() <= MAX_TAG_LEN
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ProxyError::InvalidArtifact(format!("invalid tag '{tag}'")))
    }
}

/// Paths of the filesystem store under one root directory
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn blob_path(&self, digest: &ParsedDigest) -> PathBuf {
        self.blobs_dir()
            .join(digest.algorithm.as_str())
            .join(&digest.hex)
    }

    pub fn manifest_path(&self, repository: &str, digest: &ParsedDigest) -> PathBuf {
        self.repository_dir(repository)
            .join("manifests")
            .join(digest.algorithm.as_str())
            .join(&digest.hex)
    }

    pub fn media_type_path(&self, repository: &str, digest: &ParsedDigest) -> PathBuf {
        self.manifest_path(repository, digest)
            .with_extension("media-type")
    }

    pub fn tags_dir(&self, repository: &str) -> PathBuf {
        self.repository_dir(repository).join("tags")
    }

    pub fn tag_path(&self, repository: &str, tag: &str) -> PathBuf {
        self.tags_dir(repository).join(tag)
    }

    /// Fresh path for an in-progress write
    pub fn upload_path(&self) -> PathBuf {
        self.uploads_dir().join(Uuid::new_v4().to_string())
    }

    fn repository_dir(&self, repository: &str) -> PathBuf {
        repository
            .split('/')
            .fold(self.repositories_dir(), |path, component| path.join(component))
    }
}

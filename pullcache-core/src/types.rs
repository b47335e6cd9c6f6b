//! Type definitions shared by the proxy controller and its ports

use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Docker manifest list media type
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image manifest media type
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// OCI image index media type
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Identifies the artifact an inbound pull request asks for.
///
/// Built by the request-parsing layer from the repository path plus the tag
/// and/or digest of the request. `repository` is the client-facing path and
/// therefore carries the proxy project as its first segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Proxy project the repository belongs to (e.g. "dockerhub_proxy")
    pub project_name: String,
    /// Client-facing repository path (e.g. "dockerhub_proxy/library/alpine")
    pub repository: String,
    /// Mutable tag, empty when the request is digest-addressed
    pub tag: String,
    /// Immutable content digest, empty when the request is tag-addressed
    pub digest: String,
}

impl ArtifactInfo {
    /// Tag-addressed artifact in the given project
    pub fn with_tag(project: &str, repository: &str, tag: &str) -> Self {
        Self {
            project_name: project.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: String::new(),
        }
    }

    /// Digest-addressed artifact in the given project
    pub fn with_digest(project: &str, repository: &str, digest: &str) -> Self {
        Self {
            project_name: project.to_string(),
            repository: repository.to_string(),
            tag: String::new(),
            digest: digest.to_string(),
        }
    }

    /// Whether the request names immutable content
    pub fn is_digest_addressed(&self) -> bool {
        !self.digest.is_empty()
    }

    /// Check the repository is set and at least one of tag/digest is set
    pub fn validate(&self) -> ProxyResult<()> {
        if self.repository.is_empty() {
            return Err(ProxyError::InvalidArtifact(
                "repository must not be empty".to_string(),
            ));
        }
        if self.tag.is_empty() && self.digest.is_empty() {
            return Err(ProxyError::InvalidArtifact(format!(
                "{} has neither a tag nor a digest",
                self.repository
            )));
        }
        Ok(())
    }
}

/// Describes a manifest or blob as reported by a registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub digest: String,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
}

/// A manifest document together with the descriptors it references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub payload: Bytes,
    /// Config and layer blobs for image manifests, child manifests for indexes
    pub references: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

impl Manifest {
    /// Parse a manifest payload.
    ///
    /// `media_type` is normally the `Content-Type` the registry answered with;
    /// when it is empty the `mediaType` field of the document is used.
    pub fn parse(media_type: &str, payload: Bytes) -> ProxyResult<Self> {
        let raw: RawManifest = serde_json::from_slice(&payload)?;
        let media_type = if media_type.is_empty() {
            raw.media_type.unwrap_or_default()
        } else {
            media_type.to_string()
        };

        let references = if is_index_media_type(&media_type) {
            raw.manifests
        } else {
            raw.config.into_iter().chain(raw.layers).collect()
        };

        Ok(Self {
            media_type,
            payload,
            references,
        })
    }

    /// Whether this is a manifest list / image index rather than an image manifest
    pub fn is_index(&self) -> bool {
        is_index_media_type(&self.media_type)
    }

    /// Content digest of the payload, `sha256:<hex>`
    pub fn digest(&self) -> String {
        sha256_digest(&self.payload)
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            digest: self.digest(),
            media_type: self.media_type.clone(),
            size: self.payload.len() as u64,
        }
    }
}

/// The local store's record of a cached manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub repository: String,
    pub digest: String,
    pub media_type: String,
    pub size: u64,
}

/// Result of the local-vs-remote decision for one request.
///
/// A failed decision is the `Err` side of the surrounding `ProxyResult`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Serve the content already present in the local store
    UseLocal,
    /// Fetch the content described here from upstream
    FetchRemote(Descriptor),
}

impl CacheOutcome {
    pub fn is_local(&self) -> bool {
        matches!(self, CacheOutcome::UseLocal)
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        match self {
            CacheOutcome::UseLocal => None,
            CacheOutcome::FetchRemote(desc) => Some(desc),
        }
    }
}

fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX
}

/// `sha256:<hex>` digest of `data`
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Whether `reference` looks like `<algorithm>:<hex>` rather than a tag
pub fn is_digest(reference: &str) -> bool {
    match reference.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && !hex.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '.')
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

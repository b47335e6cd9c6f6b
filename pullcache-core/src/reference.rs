//! Reference resolution for local and upstream lookups
//!
//! Client-facing repositories live under a proxy project
//! (`<project>/<upstream path>`); the upstream registry only knows the part
//! after the project. Both sides address content with the same reference so a
//! digest fetched from upstream is stored under the key it is later read by.

use crate::types::ArtifactInfo;

/// Key used for both local and upstream lookups.
///
/// The digest wins over the tag whenever both are present: digests are
/// immutable, so they can always be answered from the cache.
pub fn resolve_reference(art: &ArtifactInfo) -> &str {
    if art.digest.is_empty() {
        &art.tag
    } else {
        &art.digest
    }
}

/// Repository path as hosted by the upstream registry.
///
/// Strips the leading `<project_name>/` from the client-facing repository.
/// A repository outside the project is returned unchanged.
pub fn resolve_remote_repository(art: &ArtifactInfo) -> &str {
    if art.project_name.is_empty() {
        return &art.repository;
    }

    art.repository
        .strip_prefix(art.project_name.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(art.repository.as_str())
}

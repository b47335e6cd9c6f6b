//! Tracks blobs whose cache write is in progress

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Digests currently being written to the local store.
///
/// Cloning shares the underlying set.
#[derive(Clone, Default)]
pub struct InflightBlobs {
    digests: Arc<Mutex<HashSet<String>>>,
}

impl InflightBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the cache write for `digest`.
    ///
    /// Returns `None` when another request already holds it. The claim is
    /// released when the guard drops.
    pub fn try_acquire(&self, digest: &str) -> Option<InflightGuard> {
        if !lock(&self.digests).insert(digest.to_string()) {
            return None;
        }
        Some(InflightGuard {
            digests: Arc::clone(&self.digests),
            digest: digest.to_string(),
        })
    }

    pub fn contains(&self, digest: &str) -> bool {
        lock(&self.digests).contains(digest)
    }

    pub fn len(&self) -> usize {
        lock(&self.digests).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claim on one in-flight digest
pub struct InflightGuard {
    digests: Arc<Mutex<HashSet<String>>>,
    digest: String,
}

impl InflightGuard {
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        lock(&self.digests).remove(&self.digest);
    }
}

// A panic while holding the lock cannot leave the set half-updated
fn lock(digests: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    digests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

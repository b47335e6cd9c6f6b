//! Scoped exclusive access to a store
//!
//! Regular writes run under shared access and may overlap freely.
//! Maintenance work that must not observe half-written content (for example
//! a sweep over the blob directory) runs under exclusive access, which waits
//! for in-progress writes and holds new ones back until its closure finishes.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct ExclusiveAccess {
    lock: Arc<RwLock<()>>,
}

impl ExclusiveAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while no other shared or exclusive region is active
    pub async fn with_exclusive_access<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock.write().await;
        f().await
    }

    /// Run `f` alongside other shared regions, excluded from exclusive ones
    pub async fn with_shared_access<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock.read().await;
        f().await
    }
}

//! Wiring of configuration, adapters and the proxy controller

use crate::config::AppConfig;
use anyhow::{Context, Result};
use pullcache_core::{spawn_dispatcher, EventSender, LogDispatcher, ProxyController};
use pullcache_registry::{FsLocalStore, HttpRemoteRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct App {
    pub config: AppConfig,
    pub store: Arc<FsLocalStore>,
    pub remote: HttpRemoteRegistry,
    pub controller: ProxyController,
    dispatcher: JoinHandle<()>,
}

impl App {
    pub async fn open(config: AppConfig) -> Result<Self> {
        let (events, rx) = EventSender::channel(config.proxy.event_buffer);
        let dispatcher = spawn_dispatcher(rx, Arc::new(LogDispatcher));

        let store = FsLocalStore::open(config.storage.data_dir.clone())
            .await
            .with_context(|| {
                format!(
                    "Failed to open local store at {}",
                    config.storage.data_dir.display()
                )
            })?
            .with_events(events);
        let store = Arc::new(store);

        let remote = HttpRemoteRegistry::new(config.upstream.clone())
            .context("Failed to configure upstream registry")?;
        let controller = ProxyController::new(store.clone(), config.proxy.clone());

        debug!(
            data_dir = %config.storage.data_dir.display(),
            upstream = %remote.base_url(),
            "Proxy ready"
        );

        Ok(Self {
            config,
            store,
            remote,
            controller,
            dispatcher,
        })
    }

    /// Release the store and wait for queued registry events to be dispatched
    pub async fn shutdown(self) {
        let App {
            store,
            controller,
            dispatcher,
            ..
        } = self;
        drop(controller);
        drop(store);

        if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, dispatcher)
            .await
            .is_err()
        {
            warn!("Timed out waiting for registry events to be dispatched");
        }
    }
}

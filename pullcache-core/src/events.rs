//! Registry event notifications
//!
//! Pull and delete notifications are handed to an [`EventSender`], which
//! queues them on a bounded channel without ever waiting. A dispatcher task
//! drains the channel into an [`EventDispatcher`]. Neither a full queue nor
//! a failing dispatcher reaches the request that produced the event; both
//! are logged and the event is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Pull {
        repository: String,
        tag: String,
        occurred_at: DateTime<Utc>,
    },
    Delete {
        repository: String,
        reference: String,
        occurred_at: DateTime<Utc>,
    },
}

impl RegistryEvent {
    pub fn pull(repository: &str, tag: &str) -> Self {
        RegistryEvent::Pull {
            repository: repository.to_string(),
            tag: tag.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn delete(repository: &str, reference: &str) -> Self {
        RegistryEvent::Delete {
            repository: repository.to_string(),
            reference: reference.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn repository(&self) -> &str {
        match self {
            RegistryEvent::Pull { repository, .. } | RegistryEvent::Delete { repository, .. } => {
                repository
            }
        }
    }
}

/// Non-blocking producer side of the event queue
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<RegistryEvent>,
}

impl EventSender {
    /// Create a sender and the receiver to hand to [`spawn_dispatcher`]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RegistryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event, dropping it if the queue is full or closed
    pub fn send(&self, event: RegistryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "Dropping registry event");
        }
    }
}

/// Consumer of registry events (webhooks, audit log, ...)
#[async_trait::async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: &RegistryEvent) -> anyhow::Result<()>;
}

/// Dispatcher that only logs events
pub struct LogDispatcher;

#[async_trait::async_trait]
impl EventDispatcher for LogDispatcher {
    async fn dispatch(&self, event: &RegistryEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        info!(repository = %event.repository(), event = %payload, "Registry event");
        Ok(())
    }
}

/// Drain `rx` into `dispatcher` until every sender is dropped
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<RegistryEvent>,
    dispatcher: Arc<dyn EventDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = dispatcher.dispatch(&event).await {
                warn!(error = %e, repository = %event.repository(), "Event dispatch failed");
            }
        }
    })
}

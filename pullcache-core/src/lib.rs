//! # Pullcache Core
//!
//! Decision and streaming engine of a pull-through registry cache.
//!
//! Given a request for a manifest or blob, the [`ProxyController`] decides
//! whether the local store can answer it or whether it has to be fetched
//! from the upstream registry the proxy project mirrors. Fetched blobs are
//! streamed to the client and into the local store at the same time without
//! holding the whole artifact in memory.
//!
//! ## Architecture
//!
//! ```text
//! request ──▶ reference resolver ──▶ ProxyController ──┬──▶ LocalStore (port)
//!                                         │            └──▶ RemoteRegistry (port)
//!                                         ▼
//!                                   tee ──┬──▶ client response
//!                                         └──▶ LocalStore::push_blob
//! ```
//!
//! Concrete stores and upstream clients live outside this crate and plug in
//! through the [`LocalStore`] and [`RemoteRegistry`] traits.

pub mod access;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod inflight;
pub mod ports;
pub mod reference;
pub mod tee;
pub mod types;

pub use access::ExclusiveAccess;
pub use config::ProxyConfig;
pub use controller::{ProxiedBlob, ProxiedManifest, ProxyController};
pub use error::{classify, classify_status, ApiErrorResponse, ErrorKind, ProxyError, ProxyResult};
pub use events::{spawn_dispatcher, EventDispatcher, EventSender, LogDispatcher, RegistryEvent};
pub use inflight::{InflightBlobs, InflightGuard};
pub use ports::{BlobStream, LocalStore, RemoteRegistry};
pub use reference::{resolve_reference, resolve_remote_repository};
pub use tee::{tee, StreamSession, TeeOutcome, TeeReader, TeeReport, TeeStreams};
pub use types::{is_digest, sha256_digest, Artifact, ArtifactInfo, CacheOutcome, Descriptor, Manifest};

//! # Pullcache Registry Adapters
//!
//! Concrete implementations of the ports defined in `pullcache-core`:
//!
//! - [`FsLocalStore`]: the local cache, a content-addressed directory tree
//! - [`HttpRemoteRegistry`]: the upstream registry, reached over the OCI
//!   distribution v2 HTTP API

pub mod fs_store;
pub mod paths;
pub mod upstream;

pub use fs_store::FsLocalStore;
pub use paths::{validate_repository, validate_tag, ParsedDigest, StoreLayout};
pub use upstream::{HttpRemoteRegistry, UpstreamConfig};

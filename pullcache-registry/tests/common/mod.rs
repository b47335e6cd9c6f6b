//! Common test utilities and helpers
//!
//! Temporary stores, in-memory blob streams and a fake upstream registry
//! served by axum on an ephemeral port.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use pullcache_core::{sha256_digest, BlobStream, Descriptor, Manifest};
use pullcache_registry::FsLocalStore;
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const REPOSITORY: &str = "dockerhub_proxy/library/alpine";

pub async fn temp_store() -> (TempDir, FsLocalStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = FsLocalStore::open(temp_dir.path().join("cache"))
        .await
        .unwrap();
    (temp_dir, store)
}

pub fn stream_of(chunks: &[&str]) -> BlobStream {
    let items: Vec<io::Result<Bytes>> = chunks
        .iter()
        .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
        .collect();
    Box::pin(futures_util::stream::iter(items))
}

/// Stream yielding `prefix` and then a connection reset
pub fn failing_stream(prefix: &str) -> BlobStream {
    let items: Vec<io::Result<Bytes>> = vec![
        Ok(Bytes::copy_from_slice(prefix.as_bytes())),
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "upstream went away",
        )),
    ];
    Box::pin(futures_util::stream::iter(items))
}

/// Stream fed chunk by chunk through the returned sender
pub fn channel_stream() -> (mpsc::Sender<io::Result<Bytes>>, BlobStream) {
    let (tx, rx) = mpsc::channel(4);
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (tx, Box::pin(stream))
}

pub async fn read_all(mut stream: BlobStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

pub fn descriptor(content: &[u8]) -> Descriptor {
    Descriptor {
        digest: sha256_digest(content),
        media_type: String::new(),
        size: content.len() as u64,
    }
}

pub fn image_manifest(config: &str, layers: &[&str]) -> Manifest {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "size": 10,
                "digest": digest,
            })
        })
        .collect();
    let doc = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 6,
            "digest": config,
        },
        "layers": layers,
    });
    Manifest::parse("", Bytes::from(doc.to_string())).unwrap()
}

pub fn index_manifest(children: &[&str]) -> Manifest {
    let manifests: Vec<_> = children
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 400,
                "digest": digest,
                "platform": {"architecture": "amd64", "os": "linux"},
            })
        })
        .collect();
    let doc = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": manifests,
    });
    Manifest::parse("", Bytes::from(doc.to_string())).unwrap()
}

/// Upstream registry state served by [`spawn_upstream`]
#[derive(Default)]
pub struct FakeRegistry {
    manifests: Mutex<HashMap<(String, String), (String, Bytes)>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    pub rate_limited: AtomicBool,
    pub omit_digest_header: AtomicBool,
    pub head_requests: AtomicUsize,
    pub get_requests: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `manifest` under `reference` and under its digest
    pub fn add_manifest(&self, repository: &str, reference: &str, manifest: &Manifest) {
        let entry = (manifest.media_type.clone(), manifest.payload.clone());
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(
            (repository.to_string(), manifest.digest()),
            entry.clone(),
        );
        manifests.insert((repository.to_string(), reference.to_string()), entry);
    }

    pub fn add_blob(&self, content: Bytes) -> String {
        let digest = sha256_digest(&content);
        self.blobs.lock().unwrap().insert(digest.clone(), content);
        digest
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn manifest_response(&self, method: &Method, repository: &str, reference: &str) -> Response {
        let found = self
            .manifests
            .lock()
            .unwrap()
            .get(&(repository.to_string(), reference.to_string()))
            .cloned();
        let Some((media_type, payload)) = found else {
            return (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN").into_response();
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, media_type)
            .header(CONTENT_LENGTH, payload.len());
        if !self.omit_digest_header.load(Ordering::SeqCst) {
            builder = builder.header("docker-content-digest", sha256_digest(&payload));
        }
        let body = if *method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(payload)
        };
        builder.body(body).unwrap()
    }

    fn blob_response(&self, digest: &str) -> Response {
        match self.blobs.lock().unwrap().get(digest).cloned() {
            Some(content) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, content.len())
                .body(Body::from(content))
                .unwrap(),
            None => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN").into_response(),
        }
    }
}

async fn serve_v2(
    State(registry): State<Arc<FakeRegistry>>,
    method: Method,
    Path(rest): Path<String>,
) -> Response {
    if method == Method::HEAD {
        registry.head_requests.fetch_add(1, Ordering::SeqCst);
    } else {
        registry.get_requests.fetch_add(1, Ordering::SeqCst);
    }

    if registry.rate_limited.load(Ordering::SeqCst) {
        return (StatusCode::TOO_MANY_REQUESTS, "TOOMANYREQUESTS").into_response();
    }

    if let Some((repository, reference)) = rest.split_once("/manifests/") {
        registry.manifest_response(&method, repository, reference)
    } else if let Some((_, digest)) = rest.split_once("/blobs/") {
        registry.blob_response(digest)
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Serve `registry` on an ephemeral port; returns the base URL
pub async fn spawn_upstream(registry: Arc<FakeRegistry>) -> String {
    let app = Router::new()
        .route("/v2/{*rest}", get(serve_v2))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

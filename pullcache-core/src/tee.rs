//! # Tee Streaming
//!
//! Duplicates one upstream blob stream into two readers: the response that
//! goes back to the client and the copy written into the local store.
//!
//! ```text
//!                       ┌──▶ client channel ──▶ TeeReader (client response)
//! upstream ──▶ pump ────┤
//!                       └──▶ cache channel  ──▶ TeeReader (LocalStore::push_blob)
//! ```
//!
//! The pump runs on its own task and hands every chunk to both bounded
//! channels at once, so each side buffers at most `capacity` chunks. A slow
//! side throttles the upstream read instead of growing memory.
//!
//! Failure isolation:
//! - cache reader dropped or failing: the pump stops feeding it and keeps
//!   serving the client
//! - client reader dropped: the pump stops, drops the upstream connection and
//!   the cache reader sees an `UnexpectedEof` error so nothing partial is kept.
//!   This holds while the pump is waiting on a stalled upstream as well.
//! - upstream error: forwarded to the client, the cache side sees `UnexpectedEof`
//!
//! The upstream stream is owned by the pump and dropped exactly once, when
//! the pump returns or is aborted.

use crate::error::{ProxyError, ProxyResult};
use crate::ports::BlobStream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How a tee session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeOutcome {
    /// Upstream reached its end and the client received every chunk
    Completed,
    /// The client reader went away before the end of the stream
    ClientGone,
    /// Upstream failed part way
    UpstreamFailed,
}

/// Summary produced when the pump finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeeReport {
    /// Bytes read from upstream
    pub bytes: u64,
    pub outcome: TeeOutcome,
    /// Whether the cache reader was fed the whole stream
    pub cache_complete: bool,
}

/// One side of a tee.
///
/// Ends cleanly only when upstream reached its end; any other termination
/// yields a final error item.
pub struct TeeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    complete: Arc<AtomicBool>,
    done: bool,
}

impl TeeReader {
    fn new(rx: mpsc::Receiver<io::Result<Bytes>>, complete: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            complete,
            done: false,
        }
    }

    /// Box the reader as a [`BlobStream`]
    pub fn into_blob_stream(self) -> BlobStream {
        Box::pin(self)
    }
}

impl Stream for TeeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.complete.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "upstream stream was abandoned before completion",
                    ))))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle on the pump task of one fetch-and-cache operation
pub struct StreamSession {
    pump: JoinHandle<TeeReport>,
}

impl StreamSession {
    /// Wait for the pump to finish and release the upstream stream.
    ///
    /// Returns [`ProxyError::Stopped`] if the session was aborted.
    pub async fn finish(self) -> ProxyResult<TeeReport> {
        self.pump.await.map_err(|e| {
            if e.is_cancelled() {
                ProxyError::Stopped
            } else {
                ProxyError::Internal(format!("tee pump failed: {e}"))
            }
        })
    }

    /// Cancel the session; both readers end with an error
    pub fn abort(&self) {
        self.pump.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.pump.is_finished()
    }
}

/// The two readers and the session handle produced by [`tee`]
pub struct TeeStreams {
    pub client: TeeReader,
    pub cache: TeeReader,
    pub session: StreamSession,
}

/// Split `upstream` into a client reader and a cache reader.
///
/// Each side buffers at most `capacity` chunks (minimum 1). Must be called
/// inside a tokio runtime.
pub fn tee(upstream: BlobStream, capacity: usize) -> TeeStreams {
    let capacity = capacity.max(1);
    let (client_tx, client_rx) = mpsc::channel(capacity);
    let (cache_tx, cache_rx) = mpsc::channel(capacity);
    let complete = Arc::new(AtomicBool::new(false));

    let pump = tokio::spawn(run_pump(upstream, client_tx, cache_tx, Arc::clone(&complete)));

    TeeStreams {
        client: TeeReader::new(client_rx, Arc::clone(&complete)),
        cache: TeeReader::new(cache_rx, complete),
        session: StreamSession { pump },
    }
}

async fn run_pump(
    mut upstream: BlobStream,
    client_tx: mpsc::Sender<io::Result<Bytes>>,
    cache_tx: mpsc::Sender<io::Result<Bytes>>,
    complete: Arc<AtomicBool>,
) -> TeeReport {
    let mut cache_tx = Some(cache_tx);
    let mut bytes = 0u64;

    let outcome = loop {
        let next = tokio::select! {
            next = upstream.next() => next,
            _ = client_tx.closed() => {
                debug!(bytes, "Client disconnected, stopping upstream read");
                break TeeOutcome::ClientGone;
            }
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(error = %e, bytes, "Upstream stream failed");
                let _ = client_tx.send(Err(e)).await;
                break TeeOutcome::UpstreamFailed;
            }
            None => {
                // Set before the senders drop so readers observe it on close
                complete.store(true, Ordering::Release);
                break TeeOutcome::Completed;
            }
        };
        bytes += chunk.len() as u64;

        let cache_chunk = cache_tx.as_ref().map(|tx| (tx, chunk.clone()));
        let cache_send = async move {
            match cache_chunk {
                Some((tx, chunk)) => tx.send(Ok(chunk)).await.is_ok(),
                None => true,
            }
        };
        let (cache_alive, client_sent) = tokio::join!(cache_send, client_tx.send(Ok(chunk)));

        if !cache_alive {
            warn!(bytes, "Cache writer went away, continuing without caching");
            cache_tx = None;
        }
        if client_sent.is_err() {
            debug!(bytes, "Client disconnected, stopping upstream read");
            break TeeOutcome::ClientGone;
        }
    };

    let cache_complete = outcome == TeeOutcome::Completed && cache_tx.is_some();
    drop(upstream);
    debug!(bytes, ?outcome, cache_complete, "Tee stream finished");

    TeeReport {
        bytes,
        outcome,
        cache_complete,
    }
}

#![forbid(unsafe_code)]
//! Underlying block I/O transport for StripeCache.
//!
//! The cache core issues [`DiskRequest`]s (single- or multi-frame reads and
//! writes at page granularity) and receives completions through a registered
//! [`CompletionHandler`]. Completion order is not guaranteed.
//!
//! Two engines are provided:
//!
//! - **[`MemTransport`]**: all I/O operates on an in-memory byte vector.
//!   Used for testing and benchmarking.
//! - **[`FileTransport`]**: standard `pread`/`pwrite` syscalls against a
//!   regular file via `std::os::unix::fs::FileExt`.
//!
//! Both engines run in one of two dispatch modes: `Inline` executes requests
//! on the submitting thread and invokes the completion handler before
//! `access` returns; `Workers(n)` hands requests to a pool of background
//! threads, which models an asynchronous disk queue.

mod engine;

pub use engine::{DispatchMode, FileMedium, FileTransport, MemMedium, MemTransport, Medium, Transport};

use parking_lot::Mutex;
use sc_error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Weak;

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMethod {
    Read,
    Write,
}

/// A fixed-size memory frame the transport reads into or writes from.
///
/// The cache's page type implements this; the transport never sees page
/// metadata, only the byte payload.
pub trait Frame: Send + Sync + 'static {
    /// Frame length in bytes. All frames of one request share a length.
    fn len(&self) -> usize;

    /// True when the frame holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the frame contents into `dst` (device write path).
    fn load(&self, dst: &mut [u8]);

    /// Copy `src` into the frame (device read path).
    fn store(&self, src: &[u8]);
}

/// A single- or multi-frame request against the underlying store.
///
/// Frame `i` covers the byte range starting at `offset + i * frame_len`.
/// The `context` field is opaque routing data handed back, together with the
/// frames, to the completion handler.
#[derive(Debug)]
pub struct DiskRequest<F, C> {
    pub offset: u64,
    pub method: AccessMethod,
    pub node_id: u32,
    pub frames: Vec<F>,
    pub context: C,
}

impl<F: Frame, C> DiskRequest<F, C> {
    /// Total byte size covered by the request.
    #[must_use]
    pub fn size(&self) -> usize {
        self.frames.iter().map(Frame::len).sum()
    }
}

/// Receiver for completed requests.
///
/// Invoked once per request, on an arbitrary thread, after the transfer has
/// finished. `result` reports per-request success or failure; the request is
/// handed back whole so the handler can recover its frames and context.
pub trait CompletionHandler<F, C>: Send + Sync {
    fn on_io_complete(&self, request: DiskRequest<F, C>, result: Result<()>);
}

/// The transport contract consumed by the cache core.
pub trait IoTransport<F: Frame, C: Send + 'static>: Send + Sync {
    /// Submit a batch of requests. Completions are delivered later (or
    /// inline, for synchronous engines) to the registered handler.
    fn access(&self, requests: Vec<DiskRequest<F, C>>) -> Result<()>;

    /// Register the completion handler. The transport holds it weakly so the
    /// handler may own the transport without creating a reference cycle.
    fn set_handler(&self, handler: Weak<dyn CompletionHandler<F, C>>);

    /// Current statistics.
    fn stats(&self) -> TransportStats;

    /// Stop accepting requests and join any worker threads.
    fn shutdown(&self);
}

/// Transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total read requests completed.
    pub reads: u64,
    /// Total write requests completed.
    pub writes: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total batches submitted.
    pub batches: u64,
    /// Requests that completed with an error.
    pub failures: u64,
}

/// One journal entry describing a completed request.
///
/// The journal is off by default; tests enable it to assert on the exact
/// shape of the traffic the cache generates (offsets, direction, and how
/// many frames were coalesced into each request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRecord {
    pub offset: u64,
    pub method: AccessMethod,
    pub frames: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Journal {
    enabled: bool,
    records: Mutex<Vec<IoRecord>>,
}

impl Journal {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, record: IoRecord) {
        if self.enabled {
            self.records.lock().push(record);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<IoRecord> {
        self.records.lock().clone()
    }
}

//! User-facing requests and completion bookkeeping.
//!
//! Three request shapes flow through the cache, mirroring the layering of
//! the coordinator:
//!
//! - the caller's [`AccessRequest`], which never outlives `access()`;
//! - the heap-allocated *original* ([`OriginalRequest`]), a copy the cache
//!   owns for the request's whole life. A multi-page original is split into
//!   per-page *partials* that forward completion progress to their root;
//! - underlying disk requests, which carry pinned pages and are the
//!   transport's problem.
//!
//! An original finishes when its cumulative completed bytes reach its size;
//! sync callers are woken through a condvar, async callers through the
//! registered [`CompletionSink`].

use parking_lot::{Condvar, Mutex};
use sc_io::AccessMethod;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Receiver for asynchronous request completions.
pub trait CompletionSink: Send + Sync {
    fn on_complete(&self, result: AccessResult);
}

/// One caller request handed to `access()`.
#[derive(Debug)]
pub struct AccessRequest {
    pub offset: u64,
    pub size: usize,
    pub method: AccessMethod,
    /// Source bytes for a write; `None` for reads.
    pub payload: Option<Vec<u8>>,
    /// Sync callers block on the returned handle; async callers are
    /// notified through the coordinator's completion sink.
    pub sync: bool,
}

impl AccessRequest {
    #[must_use]
    pub fn read(offset: u64, size: usize) -> Self {
        Self {
            offset,
            size,
            method: AccessMethod::Read,
            payload: None,
            sync: true,
        }
    }

    #[must_use]
    pub fn read_async(offset: u64, size: usize) -> Self {
        Self {
            sync: false,
            ..Self::read(offset, size)
        }
    }

    #[must_use]
    pub fn write(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            size: data.len(),
            method: AccessMethod::Write,
            payload: Some(data),
            sync: true,
        }
    }

    #[must_use]
    pub fn write_async(offset: u64, data: Vec<u8>) -> Self {
        Self {
            sync: false,
            ..Self::write(offset, data)
        }
    }
}

/// A finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessResult {
    pub offset: u64,
    pub size: usize,
    pub method: AccessMethod,
    /// Bytes read; `None` for writes, and for async reads whose data was
    /// already delivered through the completion sink.
    pub data: Option<Vec<u8>>,
}

/// Continuation for a request that could not complete synchronously.
pub struct AccessHandle {
    pub(crate) orig: Arc<OriginalRequest>,
}

impl AccessHandle {
    /// Block until the request finishes. Intended for sync requests; an
    /// async request's data is delivered to the completion sink instead.
    #[must_use]
    pub fn wait(&self) -> AccessResult {
        self.orig.wait()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.orig.is_done()
    }
}

impl std::fmt::Debug for AccessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessHandle")
            .field("offset", &self.orig.offset)
            .field("size", &self.orig.size)
            .field("done", &self.orig.is_done())
            .finish()
    }
}

/// Per-request status of one `access()` call.
#[derive(Debug)]
pub enum AccessOutcome {
    /// All bytes were served from the cache (or completed inline).
    Complete(AccessResult),
    /// Underlying I/O is outstanding; the handle resolves later.
    Pending(AccessHandle),
}

enum Payload {
    /// Write source bytes, owned by the root original.
    Write(Vec<u8>),
    /// Read destination, filled page by page as completions arrive.
    Read(Mutex<Vec<u8>>),
}

struct DoneState {
    done: bool,
    result: Option<AccessResult>,
}

/// The cache-owned copy of a request; see the module docs.
pub(crate) struct OriginalRequest {
    offset: u64,
    size: usize,
    method: AccessMethod,
    sync: bool,
    /// `Some` on roots; partials borrow their root's payload.
    payload: Option<Payload>,
    parent: Option<Arc<OriginalRequest>>,
    progress: AtomicUsize,
    state: Mutex<DoneState>,
    cond: Condvar,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl OriginalRequest {
    pub(crate) fn from_access(
        offset: u64,
        size: usize,
        method: AccessMethod,
        sync: bool,
        payload: Option<Vec<u8>>,
        sink: Option<Arc<dyn CompletionSink>>,
    ) -> Arc<Self> {
        let payload = match method {
            AccessMethod::Write => Payload::Write(payload.unwrap_or_default()),
            AccessMethod::Read => Payload::Read(Mutex::new(vec![0_u8; size])),
        };
        Arc::new(Self {
            offset,
            size,
            method,
            sync,
            payload: Some(payload),
            parent: None,
            progress: AtomicUsize::new(0),
            state: Mutex::new(DoneState {
                done: false,
                result: None,
            }),
            cond: Condvar::new(),
            sink,
        })
    }

    /// Fire-and-forget read original, used by prefetch.
    pub(crate) fn detached(offset: u64, size: usize) -> Arc<Self> {
        Self::from_access(offset, size, AccessMethod::Read, false, None, None)
    }

    /// The sub-request covering `parent`'s overlap with one page.
    pub(crate) fn partial(parent: &Arc<Self>, page_off: u64, page_size: u64) -> Arc<Self> {
        debug_assert!(parent.parent.is_none(), "partials nest one level only");
        let start = parent.offset.max(page_off);
        let end = parent.end().min(page_off + page_size);
        debug_assert!(start < end, "partial outside parent range");
        Arc::new(Self {
            offset: start,
            size: (end - start) as usize,
            method: parent.method,
            sync: parent.sync,
            payload: None,
            parent: Some(Arc::clone(parent)),
            progress: AtomicUsize::new(0),
            state: Mutex::new(DoneState {
                done: false,
                result: None,
            }),
            cond: Condvar::new(),
            sink: None,
        })
    }

    /// The root original this request reports progress to.
    pub(crate) fn root(self: &Arc<Self>) -> Arc<Self> {
        self.parent.clone().unwrap_or_else(|| Arc::clone(self))
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn method(&self) -> AccessMethod {
        self.method
    }

    fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// Move bytes between this request's range (clipped to the page at
    /// `page_off`) and the page buffer: writes copy into the page, reads
    /// copy out into the root's destination. Returns bytes transferred.
    pub(crate) fn transfer_page(&self, data: &mut [u8], page_off: u64) -> usize {
        let root = self.parent.as_deref().unwrap_or(self);
        let page_end = page_off + data.len() as u64;
        let start = self.offset.max(page_off);
        let end = self.end().min(page_end);
        if start >= end {
            return 0;
        }
        let count = (end - start) as usize;
        let in_page = (start - page_off) as usize;
        let in_req = (start - root.offset) as usize;
        match &root.payload {
            Some(Payload::Write(src)) => {
                data[in_page..in_page + count].copy_from_slice(&src[in_req..in_req + count]);
            }
            Some(Payload::Read(dst)) => {
                dst.lock()[in_req..in_req + count]
                    .copy_from_slice(&data[in_page..in_page + count]);
            }
            None => {
                debug_assert!(false, "root request without payload");
                return 0;
            }
        }
        count
    }

    /// Credit `count` completed bytes against the root original, finishing
    /// it when the full size is covered.
    pub(crate) fn complete_bytes(self: &Arc<Self>, count: usize) {
        if count == 0 {
            return;
        }
        let root = self.root();
        let prev = root.progress.fetch_add(count, Ordering::AcqRel);
        debug_assert!(prev + count <= root.size, "completion overshoot");
        if prev < root.size && prev + count >= root.size {
            root.finish();
        }
    }

    fn finish(&self) {
        trace!(
            event = "request_finished",
            offset = self.offset,
            size = self.size,
            method = ?self.method,
            sync = self.sync
        );
        let data = match &self.payload {
            Some(Payload::Read(buf)) => Some(std::mem::take(&mut *buf.lock())),
            _ => None,
        };
        let result = AccessResult {
            offset: self.offset,
            size: self.size,
            method: self.method,
            data,
        };

        if self.sync || self.sink.is_none() {
            let mut state = self.state.lock();
            state.done = true;
            state.result = Some(result);
            self.cond.notify_all();
            return;
        }

        {
            let mut state = self.state.lock();
            state.done = true;
        }
        self.cond.notify_all();
        if let Some(sink) = &self.sink {
            sink.on_complete(result);
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub(crate) fn take_result(&self) -> Option<AccessResult> {
        self.state.lock().result.take()
    }

    fn wait(&self) -> AccessResult {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
        state.result.take().unwrap_or(AccessResult {
            offset: self.offset,
            size: self.size,
            method: self.method,
            data: None,
        })
    }
}

impl std::fmt::Debug for OriginalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginalRequest")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("method", &self.method)
            .field("partial", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_transfer_copies_into_page() {
        let orig = OriginalRequest::from_access(
            100,
            8,
            AccessMethod::Write,
            true,
            Some(vec![7_u8; 8]),
            None,
        );
        let mut page = vec![0_u8; 4096];
        let n = orig.transfer_page(&mut page, 0);
        assert_eq!(n, 8);
        assert_eq!(&page[100..108], &[7_u8; 8]);
        assert_eq!(page[99], 0);
        assert_eq!(page[108], 0);
    }

    #[test]
    fn read_transfer_fills_destination() {
        let orig = OriginalRequest::from_access(4000, 200, AccessMethod::Read, true, None, None);
        let mut first = vec![1_u8; 4096];
        let mut second = vec![2_u8; 4096];
        // Spans the 4096 boundary: 96 bytes from page 0, 104 from page 1.
        assert_eq!(orig.transfer_page(&mut first, 0), 96);
        assert_eq!(orig.transfer_page(&mut second, 4096), 104);

        orig.complete_bytes(96);
        assert!(!orig.is_done());
        orig.complete_bytes(104);
        assert!(orig.is_done());
        let result = orig.take_result().unwrap();
        let data = result.data.unwrap();
        assert_eq!(&data[..96], &vec![1_u8; 96][..]);
        assert_eq!(&data[96..], &vec![2_u8; 104][..]);
    }

    #[test]
    fn partial_reports_progress_to_root() {
        let root =
            OriginalRequest::from_access(0, 8192, AccessMethod::Read, true, None, None);
        let first = OriginalRequest::partial(&root, 0, 4096);
        let second = OriginalRequest::partial(&root, 4096, 4096);
        assert_eq!(first.size(), 4096);
        assert_eq!(second.offset(), 4096);

        let mut page = vec![9_u8; 4096];
        first.complete_bytes(first.transfer_page(&mut page, 0));
        assert!(!root.is_done());
        second.complete_bytes(second.transfer_page(&mut page, 4096));
        assert!(root.is_done());
    }

    #[test]
    fn partial_clips_to_parent_range() {
        let root =
            OriginalRequest::from_access(100, 5000, AccessMethod::Read, true, None, None);
        let first = OriginalRequest::partial(&root, 0, 4096);
        assert_eq!(first.offset(), 100);
        assert_eq!(first.size(), 3996);
        let second = OriginalRequest::partial(&root, 4096, 4096);
        assert_eq!(second.offset(), 4096);
        assert_eq!(second.size(), 1004);
    }

    #[test]
    fn sync_wait_returns_result() {
        let orig = OriginalRequest::from_access(0, 4, AccessMethod::Write, true, Some(vec![1, 2, 3, 4]), None);
        let waiter = Arc::clone(&orig);
        let join = std::thread::spawn(move || waiter.wait());
        orig.complete_bytes(4);
        let result = join.join().unwrap();
        assert_eq!(result.size, 4);
        assert_eq!(result.data, None);
    }

    #[test]
    fn async_completion_goes_to_sink() {
        struct Collect(Mutex<Vec<AccessResult>>);
        impl CompletionSink for Collect {
            fn on_complete(&self, result: AccessResult) {
                self.0.lock().push(result);
            }
        }

        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let orig = OriginalRequest::from_access(
            0,
            4,
            AccessMethod::Write,
            false,
            Some(vec![0_u8; 4]),
            Some(Arc::clone(&sink) as Arc<dyn CompletionSink>),
        );
        orig.complete_bytes(4);
        let seen = sink.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].size, 4);
    }
}

//! Transport engines.
//!
//! [`Transport`] couples a [`Medium`] (where the bytes live) with a dispatch
//! mode (who runs the transfer). The cache treats every engine through the
//! [`IoTransport`] trait; completion routing and bookkeeping are identical
//! across engines.

use crate::{
    AccessMethod, CompletionHandler, DiskRequest, Frame, IoRecord, IoTransport, Journal,
    TransportStats,
};
use parking_lot::{Condvar, Mutex};
use sc_error::{Result, ScError};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{error, trace, warn};

/// Raw byte store beneath a [`Transport`].
pub trait Medium: Send + Sync + 'static {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;
}

/// In-memory medium for testing and benchmarking.
#[derive(Debug)]
pub struct MemMedium {
    data: Mutex<Vec<u8>>,
}

impl MemMedium {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; size]),
        }
    }

    /// Copy out a byte range, for test assertions.
    #[must_use]
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        data[start..end].to_vec()
    }
}

impl Medium for MemMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start.checked_add(buf.len()).filter(|end| *end <= data.len());
        let Some(end) = end else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of memory",
            ));
        };
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start.checked_add(buf.len()).filter(|end| *end <= data.len());
        let Some(end) = end else {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past end of memory",
            ));
        };
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// File-backed medium using Linux `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position, so workers can issue transfers concurrently.
#[derive(Debug)]
pub struct FileMedium {
    file: Arc<std::fs::File>,
}

impl FileMedium {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .or_else(|_| OpenOptions::new().read(true).open(path.as_ref()))
            .map_err(ScError::Io)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl Medium for FileMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    fn name(&self) -> &'static str {
        "pread/pwrite"
    }
}

/// Who executes submitted requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run each request on the submitting thread; the completion handler is
    /// invoked before `access` returns.
    Inline,
    /// Hand requests to a pool of background worker threads.
    Workers(usize),
}

struct Inner<M, F, C> {
    medium: M,
    queue: Mutex<VecDeque<DiskRequest<F, C>>>,
    available: Condvar,
    stop: AtomicBool,
    handler: Mutex<Option<Weak<dyn CompletionHandler<F, C>>>>,
    stats: Mutex<TransportStats>,
    journal: Journal,
}

/// A transport engine: a [`Medium`] plus dispatch machinery.
pub struct Transport<M, F, C> {
    inner: Arc<Inner<M, F, C>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// In-memory transport.
pub type MemTransport<F, C> = Transport<MemMedium, F, C>;
/// File-backed transport.
pub type FileTransport<F, C> = Transport<FileMedium, F, C>;

impl<F: Frame, C: Send + 'static> MemTransport<F, C> {
    #[must_use]
    pub fn new(size: usize, mode: DispatchMode) -> Self {
        Self::with_medium(MemMedium::new(size), mode, false)
    }

    /// Like [`MemTransport::new`] but records every completed request.
    #[must_use]
    pub fn with_journal(size: usize, mode: DispatchMode) -> Self {
        Self::with_medium(MemMedium::new(size), mode, true)
    }

    /// Access the backing medium, for test assertions.
    #[must_use]
    pub fn medium(&self) -> &MemMedium {
        &self.inner.medium
    }
}

impl<F: Frame, C: Send + 'static> FileTransport<F, C> {
    pub fn open(path: impl AsRef<Path>, mode: DispatchMode) -> Result<Self> {
        Ok(Self::with_medium(FileMedium::open(path)?, mode, false))
    }
}

impl<M: Medium, F: Frame, C: Send + 'static> Transport<M, F, C> {
    #[must_use]
    pub fn with_medium(medium: M, mode: DispatchMode, journal: bool) -> Self {
        let inner = Arc::new(Inner {
            medium,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
            handler: Mutex::new(None),
            stats: Mutex::new(TransportStats::default()),
            journal: Journal::new(journal),
        });

        let mut workers = Vec::new();
        if let DispatchMode::Workers(count) = mode {
            for i in 0..count.max(1) {
                let shared = Arc::clone(&inner);
                let join = thread::Builder::new()
                    .name(format!("sc-io-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn transport worker");
                workers.push(join);
            }
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Completed-request journal (empty unless enabled at construction).
    #[must_use]
    pub fn journal(&self) -> Vec<IoRecord> {
        self.inner.journal.snapshot()
    }

    fn inline(&self) -> bool {
        self.workers.lock().is_empty() && !self.inner.stop.load(Ordering::Acquire)
    }
}

impl<M: Medium, F: Frame, C: Send + 'static> IoTransport<F, C> for Transport<M, F, C> {
    fn access(&self, requests: Vec<DiskRequest<F, C>>) -> Result<()> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(ScError::ShutDown);
        }
        self.inner.stats.lock().batches += 1;

        if self.inline() {
            for request in requests {
                process_request(&self.inner, request);
            }
            return Ok(());
        }

        let mut queue = self.inner.queue.lock();
        for request in requests {
            queue.push_back(request);
            self.inner.available.notify_one();
        }
        Ok(())
    }

    fn set_handler(&self, handler: Weak<dyn CompletionHandler<F, C>>) {
        *self.inner.handler.lock() = Some(handler);
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.lock().clone()
    }

    fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.available.notify_all();
        let mut workers = self.workers.lock();
        for join in workers.drain(..) {
            let _ = join.join();
        }
    }
}

impl<M, F, C> Drop for Transport<M, F, C> {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.available.notify_all();
        let mut workers = self.workers.lock();
        for join in workers.drain(..) {
            let _ = join.join();
        }
    }
}

fn worker_loop<M: Medium, F: Frame, C: Send + 'static>(inner: &Arc<Inner<M, F, C>>) {
    loop {
        let request = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(request) = queue.pop_front() {
                    break request;
                }
                // Drain the queue before honouring a stop request.
                if inner.stop.load(Ordering::Acquire) {
                    return;
                }
                inner.available.wait(&mut queue);
            }
        };
        process_request(inner, request);
    }
}

fn process_request<M: Medium, F: Frame, C: Send + 'static>(
    inner: &Inner<M, F, C>,
    request: DiskRequest<F, C>,
) {
    let mut scratch = Vec::new();
    let mut result = Ok(());
    for (i, frame) in request.frames.iter().enumerate() {
        let frame_len = frame.len();
        if scratch.len() != frame_len {
            scratch.resize(frame_len, 0);
        }
        let offset = request.offset + (i as u64) * (frame_len as u64);
        let transfer = match request.method {
            AccessMethod::Read => inner
                .medium
                .read_at(offset, &mut scratch)
                .map(|()| frame.store(&scratch)),
            AccessMethod::Write => {
                frame.load(&mut scratch);
                inner.medium.write_at(offset, &scratch)
            }
        };
        if let Err(err) = transfer {
            error!(
                event = "transfer_failed",
                engine = inner.medium.name(),
                offset,
                method = ?request.method,
                error = %err
            );
            result = Err(ScError::Io(err));
            break;
        }
    }

    let bytes = request.size();
    {
        let mut stats = inner.stats.lock();
        match (&result, request.method) {
            (Ok(()), AccessMethod::Read) => {
                stats.reads += 1;
                stats.bytes_read += bytes as u64;
            }
            (Ok(()), AccessMethod::Write) => {
                stats.writes += 1;
                stats.bytes_written += bytes as u64;
            }
            (Err(_), _) => stats.failures += 1,
        }
    }
    inner.journal.push(IoRecord {
        offset: request.offset,
        method: request.method,
        frames: request.frames.len(),
        bytes,
    });
    trace!(
        event = "request_complete",
        engine = inner.medium.name(),
        offset = request.offset,
        method = ?request.method,
        frames = request.frames.len(),
        ok = result.is_ok()
    );

    let handler = inner.handler.lock().clone();
    match handler.and_then(|weak| weak.upgrade()) {
        Some(handler) => handler.on_io_complete(request, result),
        None => warn!(
            event = "completion_dropped",
            engine = inner.medium.name(),
            offset = request.offset,
            "no completion handler registered"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Condvar as PlCondvar, Mutex as PlMutex};

    /// Standalone frame for exercising the transport without the cache.
    struct TestFrame {
        bytes: PlMutex<Vec<u8>>,
    }

    impl TestFrame {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes: PlMutex::new(vec![0_u8; len]),
            })
        }

        fn filled(byte: u8, len: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes: PlMutex::new(vec![byte; len]),
            })
        }

        fn contents(&self) -> Vec<u8> {
            self.bytes.lock().clone()
        }
    }

    impl Frame for Arc<TestFrame> {
        fn len(&self) -> usize {
            self.bytes.lock().len()
        }

        fn load(&self, dst: &mut [u8]) {
            dst.copy_from_slice(&self.bytes.lock());
        }

        fn store(&self, src: &[u8]) {
            self.bytes.lock().copy_from_slice(src);
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        completions: PlMutex<Vec<(u64, AccessMethod, bool)>>,
        arrived: PlCondvar,
    }

    impl RecordingHandler {
        fn wait_for(&self, count: usize) {
            let mut completions = self.completions.lock();
            while completions.len() < count {
                self.arrived.wait(&mut completions);
            }
        }
    }

    impl CompletionHandler<Arc<TestFrame>, ()> for RecordingHandler {
        fn on_io_complete(&self, request: DiskRequest<Arc<TestFrame>, ()>, result: Result<()>) {
            self.completions
                .lock()
                .push((request.offset, request.method, result.is_ok()));
            self.arrived.notify_all();
        }
    }

    fn request(
        offset: u64,
        method: AccessMethod,
        frames: Vec<Arc<TestFrame>>,
    ) -> DiskRequest<Arc<TestFrame>, ()> {
        DiskRequest {
            offset,
            method,
            node_id: 0,
            frames,
            context: (),
        }
    }

    #[test]
    fn mem_inline_write_read_roundtrip() {
        let transport: MemTransport<Arc<TestFrame>, ()> =
            MemTransport::new(8192, DispatchMode::Inline);
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        let src = TestFrame::filled(0xAB, 4096);
        transport
            .access(vec![request(0, AccessMethod::Write, vec![src])])
            .unwrap();

        let dst = TestFrame::new(4096);
        transport
            .access(vec![request(0, AccessMethod::Read, vec![Arc::clone(&dst)])])
            .unwrap();

        assert_eq!(dst.contents(), vec![0xAB; 4096]);
        let completions = handler.completions.lock();
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|(_, _, ok)| *ok));
    }

    #[test]
    fn mem_inline_multi_frame_layout() {
        let transport: MemTransport<Arc<TestFrame>, ()> =
            MemTransport::new(16384, DispatchMode::Inline);
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        // One request covering three consecutive 4K frames.
        let frames = vec![
            TestFrame::filled(1, 4096),
            TestFrame::filled(2, 4096),
            TestFrame::filled(3, 4096),
        ];
        transport
            .access(vec![request(4096, AccessMethod::Write, frames)])
            .unwrap();

        assert_eq!(transport.medium().snapshot(4096, 1)[0], 1);
        assert_eq!(transport.medium().snapshot(8192, 1)[0], 2);
        assert_eq!(transport.medium().snapshot(12288, 1)[0], 3);
    }

    #[test]
    fn read_past_end_reports_failure() {
        let transport: MemTransport<Arc<TestFrame>, ()> =
            MemTransport::new(1024, DispatchMode::Inline);
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        transport
            .access(vec![request(512, AccessMethod::Read, vec![TestFrame::new(
                1024,
            )])])
            .unwrap();

        let completions = handler.completions.lock();
        assert_eq!(completions.len(), 1);
        assert!(!completions[0].2);
        assert_eq!(transport.stats().failures, 1);
    }

    #[test]
    fn worker_mode_completes_asynchronously() {
        let transport: MemTransport<Arc<TestFrame>, ()> =
            MemTransport::new(8192, DispatchMode::Workers(2));
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        for i in 0..4 {
            transport
                .access(vec![request(
                    i * 2048,
                    AccessMethod::Write,
                    vec![TestFrame::filled(i as u8 + 1, 2048)],
                )])
                .unwrap();
        }
        handler.wait_for(4);

        for i in 0..4_u64 {
            assert_eq!(transport.medium().snapshot(i * 2048, 1)[0], i as u8 + 1);
        }
        transport.shutdown();
        assert!(matches!(
            transport.access(vec![]),
            Err(ScError::ShutDown)
        ));
    }

    #[test]
    fn stats_accumulate() {
        let transport: MemTransport<Arc<TestFrame>, ()> =
            MemTransport::new(8192, DispatchMode::Inline);
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        transport
            .access(vec![
                request(0, AccessMethod::Write, vec![TestFrame::filled(7, 1024)]),
                request(0, AccessMethod::Read, vec![TestFrame::new(512)]),
            ])
            .unwrap();

        let stats = transport.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_written, 1024);
        assert_eq!(stats.bytes_read, 512);
        assert_eq!(stats.batches, 1);
    }

    #[test]
    fn journal_records_request_shape() {
        let transport: MemTransport<Arc<TestFrame>, ()> =
            MemTransport::with_journal(16384, DispatchMode::Inline);
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        let frames = vec![TestFrame::filled(9, 4096), TestFrame::filled(9, 4096)];
        transport
            .access(vec![request(4096, AccessMethod::Write, frames)])
            .unwrap();

        let journal = transport.journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].offset, 4096);
        assert_eq!(journal[0].frames, 2);
        assert_eq!(journal[0].bytes, 8192);
        assert_eq!(journal[0].method, AccessMethod::Write);
    }

    #[test]
    fn file_transport_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.img");
        std::fs::write(&path, vec![0_u8; 8192]).unwrap();

        let transport: FileTransport<Arc<TestFrame>, ()> =
            FileTransport::open(&path, DispatchMode::Inline).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        transport.set_handler(Arc::downgrade(&handler) as Weak<_>);

        let src = TestFrame::filled(0x42, 4096);
        transport
            .access(vec![request(4096, AccessMethod::Write, vec![src])])
            .unwrap();

        let dst = TestFrame::new(4096);
        transport
            .access(vec![request(
                4096,
                AccessMethod::Read,
                vec![Arc::clone(&dst)],
            )])
            .unwrap();
        assert_eq!(dst.contents(), vec![0x42; 4096]);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[4096..8192], &vec![0x42_u8; 4096][..]);
    }
}

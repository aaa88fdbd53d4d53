//! The cached-I/O coordinator.
//!
//! [`CachedIo`] is the entry point workers share: it translates user
//! requests into page lookups, drives page state transitions, issues
//! underlying reads and write-backs, and handles completion callbacks from
//! the transport. One instance serves any number of threads; per-worker
//! facades are just clones of the `Arc`.
//!
//! # Request flow
//!
//! `access()` walks each request's page-aligned offsets through
//! `cache.lookup`. Hits on ready pages complete inline (single-page
//! requests through a batched fast path that skips the heap copy of the
//! request). Misses coalesce contiguous pages into multi-frame reads,
//! clamped to the RAID stripe. An eviction that surfaced a dirty victim
//! obligates *this* thread to write the old contents back before the frame
//! can load its new offset; every other thread queues behind the page's
//! deferred-request chain and is resumed by the completion callback.

use crate::config::CacheConfig;
use crate::flush::FlushEngine;
use crate::manager::MemoryManager;
use crate::page::{PageRef, PendingOp};
use crate::request::{
    AccessHandle, AccessOutcome, AccessRequest, AccessResult, CompletionSink, OriginalRequest,
};
use crate::table::{AssociativeCache, DirectoryStats, LookupResult};
use parking_lot::Mutex;
use sc_error::{Result, ScError};
use sc_io::{AccessMethod, CompletionHandler, DiskRequest, IoTransport};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Routing context stamped on every underlying request.
pub(crate) enum IoCtx {
    /// Fill page(s) for `orig`; also used for the read-before-sub-page-write
    /// and for prefetch.
    Read { orig: Arc<OriginalRequest> },
    /// Write-back of an evicted frame's old contents, possibly merged with
    /// neighbouring dirty pages. `primary` indexes the old-dirty frame whose
    /// new offset `orig` is waiting to use.
    Writeback {
        orig: Arc<OriginalRequest>,
        primary: usize,
    },
    /// Flush-engine initiated write.
    Flush,
}

/// Opaque completion-routing context; see [`CacheTransport`].
pub struct CacheIoContext(pub(crate) IoCtx);

impl std::fmt::Debug for CacheIoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.0 {
            IoCtx::Read { .. } => "read",
            IoCtx::Writeback { .. } => "writeback",
            IoCtx::Flush => "flush",
        };
        f.debug_tuple("CacheIoContext").field(&kind).finish()
    }
}

/// The transport shape this cache drives.
pub type CacheTransport = dyn IoTransport<PageRef, CacheIoContext>;

pub(crate) type DynTransport = CacheTransport;

/// Coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIoStats {
    /// Page lookups performed.
    pub accesses: u64,
    /// Lookups that found the offset already mapped.
    pub hits: u64,
    /// Lookups that admitted the offset into a frame.
    pub misses: u64,
    /// Single-page requests completed through the batched fast path.
    pub fast_path: u64,
}

impl CacheIoStats {
    /// Page hit ratio in the range [0.0, 1.0].
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        if self.accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.accesses as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    accesses: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fast_path: AtomicU64,
}

/// A single-page ready hit deferred to the batched fast pass.
struct FastOp {
    offset: u64,
    size: usize,
    method: AccessMethod,
    payload: Option<Vec<u8>>,
    sync: bool,
    page: PageRef,
}

pub struct CachedIo {
    config: CacheConfig,
    cache: Arc<AssociativeCache>,
    transport: Arc<DynTransport>,
    flush: Arc<FlushEngine>,
    /// Requests re-queued by completions (old-dirty retries and drained
    /// per-page chains) awaiting another pass through the state machine.
    pending: Mutex<VecDeque<PendingOp>>,
    sink: Mutex<Option<Arc<dyn CompletionSink>>>,
    stats: StatCounters,
}

impl CachedIo {
    /// Build a cache with a private page reserve sized to `max_size`.
    ///
    /// `config.num_nodes` caps this cache's expansion share at
    /// `max_size / num_nodes`, matching a deployment with one cache per
    /// NUMA partition over a shared reserve.
    pub fn new(config: CacheConfig, transport: Arc<DynTransport>) -> Result<Arc<Self>> {
        config.validate()?;
        let manager = Arc::new(MemoryManager::new(config.max_size, config.page()));
        for _ in 1..config.num_nodes {
            manager.register_cache();
        }
        Self::with_manager(config, transport, manager)
    }

    /// Build a cache drawing frames from a shared reserve.
    pub fn with_manager(
        config: CacheConfig,
        transport: Arc<DynTransport>,
        manager: Arc<MemoryManager>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cache = Arc::new(AssociativeCache::new(&config, manager)?);
        let flush = FlushEngine::start(Arc::clone(&cache), Arc::clone(&transport), &config)?;
        let io = Arc::new(Self {
            config,
            cache,
            transport: Arc::clone(&transport),
            flush,
            pending: Mutex::new(VecDeque::new()),
            sink: Mutex::new(None),
            stats: StatCounters::default(),
        });
        let io_dyn: Arc<dyn CompletionHandler<PageRef, CacheIoContext>> = Arc::clone(&io) as _;
        let handler: Weak<dyn CompletionHandler<PageRef, CacheIoContext>> = Arc::downgrade(&io_dyn);
        transport.set_handler(handler);
        Ok(io)
    }

    /// The associative directory, exposed for direct `search` access and
    /// for stats.
    #[must_use]
    pub fn cache(&self) -> &Arc<AssociativeCache> {
        &self.cache
    }

    #[must_use]
    pub fn directory_stats(&self) -> DirectoryStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn stats(&self) -> CacheIoStats {
        CacheIoStats {
            accesses: self.stats.accesses.load(Ordering::Acquire),
            hits: self.stats.hits.load(Ordering::Acquire),
            misses: self.stats.misses.load(Ordering::Acquire),
            fast_path: self.stats.fast_path.load(Ordering::Acquire),
        }
    }

    /// Register the sink notified for async request completions.
    pub fn set_callback(&self, sink: Arc<dyn CompletionSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Write-path callback into the flush engine.
    pub fn mark_dirty_pages(&self, offsets: &[u64]) {
        self.flush.mark_dirty(offsets);
    }

    /// Quiesce the flush engine and the transport.
    pub fn shutdown(&self) {
        self.flush.shutdown();
        self.transport.shutdown();
    }

    fn page_bytes(&self) -> u64 {
        u64::from(self.config.page_size)
    }

    fn submit(&self, requests: Vec<DiskRequest<PageRef, CacheIoContext>>) {
        if let Err(err) = self.transport.access(requests) {
            warn!(event = "submit_failed", error = %err);
        }
    }

    fn validate(&self, request: &AccessRequest) -> Result<()> {
        if request.size == 0 {
            return Err(ScError::MalformedRequest("zero-size request".to_owned()));
        }
        if request.offset.checked_add(request.size as u64).is_none() {
            return Err(ScError::MalformedRequest(format!(
                "range overflow at offset {}",
                request.offset
            )));
        }
        match request.method {
            AccessMethod::Write => {
                let payload_len = request.payload.as_ref().map_or(0, Vec::len);
                if payload_len != request.size {
                    return Err(ScError::MalformedRequest(format!(
                        "write payload is {payload_len} bytes for a {}-byte request",
                        request.size
                    )));
                }
            }
            AccessMethod::Read => {
                if request.payload.is_some() {
                    return Err(ScError::MalformedRequest(
                        "read request carries a payload".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Synchronous/asynchronous batch entry point.
    pub fn access(&self, requests: Vec<AccessRequest>) -> Result<Vec<AccessOutcome>> {
        self.drain_pending();
        for request in &requests {
            self.validate(request)?;
        }

        let page_size = self.page_bytes();
        let ps = self.config.page();
        let sink = self.sink.lock().clone();
        let mut outcomes: Vec<Option<AccessOutcome>> = Vec::with_capacity(requests.len());
        let mut fast: Vec<(usize, FastOp)> = Vec::new();
        let mut newly_dirty: Vec<u64> = Vec::new();

        for request in requests {
            let AccessRequest {
                offset,
                size,
                method,
                payload,
                sync,
            } = request;
            let begin = ps.round_down(offset);
            let end = ps
                .round_up(offset + size as u64)
                .unwrap_or(u64::MAX & !(page_size - 1));
            let npages = ((end - begin) / page_size) as usize;
            let single_page = npages == 1;

            let mut payload = payload;
            let mut orig: Option<Arc<OriginalRequest>> = None;
            let mut run: Vec<PageRef> = Vec::new();
            let mut run_start = 0_u64;
            let mut completed = 0_usize;
            let mut fast_hit: Option<FastOp> = None;

            let mut page_off = begin;
            while page_off < end {
                let LookupResult {
                    page,
                    old_off,
                    fresh,
                } = self.cache.lookup(page_off);
                self.stats.accesses.fetch_add(1, Ordering::AcqRel);
                if fresh {
                    self.stats.misses.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.stats.hits.fetch_add(1, Ordering::AcqRel);
                }

                // Cached single-page requests skip the heap copy entirely.
                if single_page && !fresh && page.is_data_ready() {
                    fast_hit = Some(FastOp {
                        offset,
                        size,
                        method,
                        payload: payload.take(),
                        sync,
                        page,
                    });
                    break;
                }

                let orig_ref = Arc::clone(orig.get_or_insert_with(|| {
                    OriginalRequest::from_access(
                        offset,
                        size,
                        method,
                        sync,
                        payload.take(),
                        sink.clone(),
                    )
                }));

                if page.is_old_dirty() {
                    // The frame still carries a previous offset's dirty
                    // bytes. Flush any coalesced reads first, then either
                    // write the old contents out (we evicted it) or queue
                    // behind the thread that is.
                    if !run.is_empty() {
                        completed +=
                            self.issue_read_run(run_start, std::mem::take(&mut run), &orig_ref);
                    }
                    let sub = if single_page {
                        Arc::clone(&orig_ref)
                    } else {
                        OriginalRequest::partial(&orig_ref, page_off, page_size)
                    };
                    if let Some(old) = old_off {
                        debug_assert_ne!(old, page_off);
                        self.write_dirty_page(page, old, sub);
                        page_off += page_size;
                        continue;
                    }
                    let arc = page.page_arc();
                    let mut inner = arc.lock();
                    if page.is_old_dirty() {
                        inner.pending.push_back(PendingOp { req: sub, page });
                        drop(inner);
                        page_off += page_size;
                        continue;
                    }
                    // The write-back raced to completion; fall through.
                    drop(inner);
                }

                match method {
                    AccessMethod::Write => {
                        // Writes are always broken into pages.
                        let sub = if single_page {
                            Arc::clone(&orig_ref)
                        } else {
                            OriginalRequest::partial(&orig_ref, page_off, page_size)
                        };
                        completed += self.do_write(sub, page, &mut newly_dirty);
                    }
                    AccessMethod::Read => {
                        if run.is_empty() {
                            run_start = page_off;
                        }
                        run.push(page);
                        let run_end = run_start + run.len() as u64 * page_size;
                        // Large reads stop at the frame cap and at RAID
                        // stripe boundaries.
                        if run.len() >= self.config.max_frames_per_request
                            || run_end % self.config.raid_block_bytes() == 0
                        {
                            completed += self.issue_read_run(
                                run_start,
                                std::mem::take(&mut run),
                                &orig_ref,
                            );
                        }
                    }
                }
                page_off += page_size;
            }

            if let Some(op) = fast_hit {
                fast.push((outcomes.len(), op));
                outcomes.push(None);
                continue;
            }

            let Some(orig) = orig else {
                // Unreachable: a non-fast request always allocates one.
                debug_assert!(false, "request processed without an original");
                outcomes.push(Some(AccessOutcome::Complete(AccessResult {
                    offset,
                    size,
                    method,
                    data: None,
                })));
                continue;
            };
            if !run.is_empty() {
                completed += self.issue_read_run(run_start, std::mem::take(&mut run), &orig);
            }

            let outcome = if completed == size || orig.is_done() {
                AccessOutcome::Complete(orig.take_result().unwrap_or(AccessResult {
                    offset,
                    size,
                    method,
                    data: None,
                }))
            } else {
                trace!(event = "request_pending", offset, size, method = ?method);
                AccessOutcome::Pending(AccessHandle { orig })
            };
            outcomes.push(Some(outcome));
        }

        self.process_fast(fast, &mut outcomes, &mut newly_dirty);
        self.flush.mark_dirty(&newly_dirty);

        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or(AccessOutcome::Complete(AccessResult {
                    offset: 0,
                    size: 0,
                    method: AccessMethod::Read,
                    data: None,
                }))
            })
            .collect())
    }

    /// Blocking single-range read.
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let outcomes = self.access(vec![AccessRequest::read(offset, size)])?;
        match outcomes.into_iter().next() {
            Some(AccessOutcome::Complete(result)) => Ok(result.data.unwrap_or_default()),
            Some(AccessOutcome::Pending(handle)) => Ok(handle.wait().data.unwrap_or_default()),
            None => Err(ScError::MalformedRequest("empty access".to_owned())),
        }
    }

    /// Blocking single-range write.
    pub fn write(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        let outcomes = self.access(vec![AccessRequest::write(offset, data)])?;
        match outcomes.into_iter().next() {
            Some(AccessOutcome::Complete(_)) => Ok(()),
            Some(AccessOutcome::Pending(handle)) => {
                let _ = handle.wait();
                Ok(())
            }
            None => Err(ScError::MalformedRequest("empty access".to_owned())),
        }
    }

    /// Prefetch helper: walk page offsets, start loads for pages that are
    /// neither ready nor in flight, and drop the references without
    /// waiting.
    pub fn preload(&self, start: u64, size: usize) -> Result<()> {
        let ps = self.config.page();
        let page_size = self.page_bytes();
        if size > self.config.max_size {
            return Err(ScError::MalformedRequest(format!(
                "preload of {size} bytes exceeds cache capacity {}",
                self.config.max_size
            )));
        }
        if !ps.is_aligned(start) {
            return Err(ScError::MalformedRequest(format!(
                "preload start {start} is not page-aligned"
            )));
        }
        let Some(end) = ps.round_up(start + size as u64) else {
            return Err(ScError::MalformedRequest("preload range overflow".to_owned()));
        };

        for page_off in (start..end).step_by(page_size as usize) {
            let LookupResult { page, old_off, .. } = self.cache.lookup(page_off);
            if page.is_old_dirty() {
                if let Some(old) = old_off {
                    // Prefetch evicted a dirty page; it still owes the
                    // write-back, which reloads the frame afterwards.
                    let orig = OriginalRequest::detached(page_off, page_size as usize);
                    self.write_dirty_page(page, old, orig);
                }
                continue;
            }
            let arc = page.page_arc();
            let inner = arc.lock();
            if !page.is_data_ready() && !page.is_io_pending() {
                page.set_io_pending(true);
                drop(inner);
                let orig = OriginalRequest::detached(page_off, page_size as usize);
                self.submit(vec![DiskRequest {
                    offset: page_off,
                    method: AccessMethod::Read,
                    node_id: self.config.node_id,
                    frames: vec![page],
                    context: CacheIoContext(IoCtx::Read { orig }),
                }]);
            }
        }
        Ok(())
    }

    /// The batched pass over cached single-page requests.
    fn process_fast(
        &self,
        ops: Vec<(usize, FastOp)>,
        outcomes: &mut [Option<AccessOutcome>],
        newly_dirty: &mut Vec<u64>,
    ) {
        let sink = self.sink.lock().clone();
        for (slot, op) in ops {
            self.stats.fast_path.fetch_add(1, Ordering::AcqRel);
            let FastOp {
                offset,
                size,
                method,
                payload,
                sync,
                page,
            } = op;
            let page_off = self.config.page().round_down(offset);
            debug_assert_eq!(page.offset(), Some(page_off));
            let in_page = (offset - page_off) as usize;
            let result = match method {
                AccessMethod::Read => {
                    let data = {
                        let inner = page.lock();
                        inner.data[in_page..in_page + size].to_vec()
                    };
                    AccessResult {
                        offset,
                        size,
                        method,
                        data: Some(data),
                    }
                }
                AccessMethod::Write => {
                    let src = payload.unwrap_or_default();
                    let first_dirty = {
                        let mut inner = page.lock();
                        inner.data[in_page..in_page + size].copy_from_slice(&src);
                        !page.set_dirty(true)
                    };
                    if first_dirty {
                        newly_dirty.push(page_off);
                    }
                    AccessResult {
                        offset,
                        size,
                        method,
                        data: None,
                    }
                }
            };
            if !sync {
                if let Some(sink) = &sink {
                    sink.on_complete(result.clone());
                }
            }
            outcomes[slot] = Some(AccessOutcome::Complete(result));
        }
    }

    /// Apply a single-page-bounded write against `page`.
    ///
    /// Returns the bytes completed synchronously; zero means the request
    /// was deferred (page loading) or turned into a read-before-write.
    fn do_write(
        &self,
        req: Arc<OriginalRequest>,
        page: PageRef,
        newly_dirty: &mut Vec<u64>,
    ) -> usize {
        let page_size = self.page_bytes();
        let Some(page_off) = page.offset() else {
            debug_assert!(false, "write against an unmapped frame");
            return 0;
        };
        debug_assert!(!page.is_old_dirty());

        let arc = page.page_arc();
        let mut inner = arc.lock();
        if page.is_data_ready() {
            let count = req.transfer_page(&mut inner.data, page_off);
            let first_dirty = count > 0 && !page.set_dirty(true);
            drop(inner);
            if first_dirty {
                newly_dirty.push(page_off);
            }
            req.complete_bytes(count);
            count
        } else if page.is_io_pending() {
            // A read for this frame is in flight; resume when it lands.
            inner.pending.push_back(PendingOp { req, page });
            0
        } else if req.offset() == page_off && req.size() as u64 == page_size {
            // Full-page overwrite: no point reading first.
            let count = req.transfer_page(&mut inner.data, page_off);
            page.set_data_ready(true);
            let first_dirty = !page.set_dirty(true);
            drop(inner);
            if first_dirty {
                newly_dirty.push(page_off);
            }
            req.complete_bytes(count);
            count
        } else {
            // Sub-page write to a cold frame: load the page, then the
            // completion path replays the write from the original.
            debug_assert!(!page.is_dirty());
            page.set_io_pending(true);
            drop(inner);
            let root = req.root();
            self.submit(vec![DiskRequest {
                offset: page_off,
                method: AccessMethod::Read,
                node_id: self.config.node_id,
                frames: vec![page],
                context: CacheIoContext(IoCtx::Read { orig: root }),
            }]);
            0
        }
    }

    /// Apply a single-page-bounded read against `page`.
    fn do_read(&self, req: Arc<OriginalRequest>, page: PageRef) -> usize {
        let Some(page_off) = page.offset() else {
            debug_assert!(false, "read against an unmapped frame");
            return 0;
        };
        let arc = page.page_arc();
        let mut inner = arc.lock();
        if page.is_data_ready() {
            let count = req.transfer_page(&mut inner.data, page_off);
            drop(inner);
            req.complete_bytes(count);
            count
        } else if page.is_io_pending() {
            inner.pending.push_back(PendingOp { req, page });
            0
        } else {
            debug_assert!(!page.is_dirty());
            page.set_io_pending(true);
            drop(inner);
            let root = req.root();
            self.submit(vec![DiskRequest {
                offset: page_off,
                method: AccessMethod::Read,
                node_id: self.config.node_id,
                frames: vec![page],
                context: CacheIoContext(IoCtx::Read { orig: root }),
            }]);
            0
        }
    }

    /// Issue a coalesced read over contiguous pages starting at `start`.
    ///
    /// Pages already loading break the run (their slice of the original is
    /// parked on the page); ready pages complete inline. Returns the bytes
    /// completed synchronously.
    fn issue_read_run(&self, start: u64, pages: Vec<PageRef>, orig: &Arc<OriginalRequest>) -> usize {
        let page_size = self.page_bytes();
        let mut completed = 0;
        let mut building: Vec<PageRef> = Vec::new();
        let mut build_start = 0_u64;
        let mut queue: VecDeque<(u64, PageRef)> = pages
            .into_iter()
            .enumerate()
            .map(|(i, page)| (start + i as u64 * page_size, page))
            .collect();

        while let Some((page_off, page)) = queue.pop_front() {
            let arc = page.page_arc();
            let mut inner = arc.lock();
            if !page.is_data_ready() && !page.is_io_pending() {
                debug_assert!(!page.is_dirty());
                page.set_io_pending(true);
                drop(inner);
                if building.is_empty() {
                    build_start = page_off;
                }
                building.push(page);
            } else if !page.is_data_ready() {
                // In flight. Submit what we have and retry this page, or
                // park a partial on it.
                if !building.is_empty() {
                    drop(inner);
                    self.submit_read_run(build_start, std::mem::take(&mut building), orig);
                    queue.push_front((page_off, page));
                    continue;
                }
                let partial = OriginalRequest::partial(orig, page_off, page_size);
                inner.pending.push_back(PendingOp { req: partial, page });
            } else {
                // Ready: the run breaks here and this page completes now.
                let count = orig.transfer_page(&mut inner.data, page_off);
                drop(inner);
                if !building.is_empty() {
                    self.submit_read_run(build_start, std::mem::take(&mut building), orig);
                }
                orig.complete_bytes(count);
                completed += count;
            }
        }
        if !building.is_empty() {
            self.submit_read_run(build_start, building, orig);
        }
        completed
    }

    fn submit_read_run(&self, start: u64, frames: Vec<PageRef>, orig: &Arc<OriginalRequest>) {
        trace!(
            event = "read_run",
            start,
            frames = frames.len()
        );
        self.submit(vec![DiskRequest {
            offset: start,
            method: AccessMethod::Read,
            node_id: self.config.node_id,
            frames,
            context: CacheIoContext(IoCtx::Read {
                orig: Arc::clone(orig),
            }),
        }]);
    }

    /// Write an evicted frame's old dirty contents back to `old_off`,
    /// merging directory-adjacent dirty pages within the RAID stripe.
    /// `orig` (the request for the frame's *new* offset) resumes when the
    /// write lands.
    fn write_dirty_page(&self, page: PageRef, old_off: u64, orig: Arc<OriginalRequest>) {
        let page_size = self.page_bytes();
        let raid = self.config.raid_block_bytes();
        {
            let _inner = page.lock();
            debug_assert!(!page.is_io_pending());
            page.set_io_pending(true);
            page.set_prepare_writeback(true);
        }
        let block_start = old_off & !(raid - 1);
        let block_end = block_start + raid;

        let mut frames = vec![page];
        let mut start = old_off;
        let mut primary = 0_usize;

        let mut forward = old_off + page_size;
        while forward < block_end {
            let Some(neighbour) = self.cache.find(forward) else {
                break;
            };
            if !claim_dirty(&neighbour) {
                break;
            }
            frames.push(neighbour);
            forward += page_size;
        }

        let mut backward = old_off;
        while backward >= block_start + page_size {
            let candidate = backward - page_size;
            let Some(neighbour) = self.cache.find(candidate) else {
                break;
            };
            if !claim_dirty(&neighbour) {
                break;
            }
            frames.insert(0, neighbour);
            start = candidate;
            primary += 1;
            backward = candidate;
        }

        debug!(
            event = "old_dirty_writeback",
            offset = old_off,
            merged = frames.len() - 1
        );
        self.submit(vec![DiskRequest {
            offset: start,
            method: AccessMethod::Write,
            node_id: self.config.node_id,
            frames,
            context: CacheIoContext(IoCtx::Writeback { orig, primary }),
        }]);
    }

    /// Run every re-queued request through the page state machine again.
    fn drain_pending(&self) {
        let mut newly_dirty = Vec::new();
        loop {
            let Some(op) = self.pending.lock().pop_front() else {
                break;
            };
            let PendingOp { req, page } = op;
            debug_assert!(!page.is_old_dirty());
            match req.method() {
                AccessMethod::Write => {
                    self.do_write(req, page, &mut newly_dirty);
                }
                AccessMethod::Read => {
                    self.do_read(req, page);
                }
            }
        }
        if !newly_dirty.is_empty() {
            self.flush.mark_dirty(&newly_dirty);
        }
    }

    /// A read landed: publish the data, then replay the chains that were
    /// waiting on each page.
    fn read_fill_complete(&self, base: u64, frames: Vec<PageRef>, orig: &Arc<OriginalRequest>) {
        let page_size = self.page_bytes();
        let mut newly_dirty = Vec::new();
        for (i, page) in frames.into_iter().enumerate() {
            let page_off = base + i as u64 * page_size;
            debug_assert_eq!(page.offset(), Some(page_off));
            let (count, first_dirty, drained) = {
                let mut inner = page.lock();
                page.set_data_ready(true);
                page.set_io_pending(false);
                let count = orig.transfer_page(&mut inner.data, page_off);
                let first_dirty = matches!(orig.method(), AccessMethod::Write)
                    && count > 0
                    && !page.set_dirty(true);
                (count, first_dirty, std::mem::take(&mut inner.pending))
            };
            if first_dirty {
                newly_dirty.push(page_off);
            }
            orig.complete_bytes(count);
            for op in drained {
                self.apply_ready(op, &mut newly_dirty);
            }
        }
        self.flush.mark_dirty(&newly_dirty);
    }

    /// Complete a deferred request against its now-ready page.
    fn apply_ready(&self, op: PendingOp, newly_dirty: &mut Vec<u64>) {
        let PendingOp { req, page } = op;
        let Some(page_off) = page.offset() else {
            debug_assert!(false, "deferred request on an unmapped frame");
            return;
        };
        debug_assert!(page.is_data_ready());
        let (count, first_dirty) = {
            let mut inner = page.lock();
            let count = req.transfer_page(&mut inner.data, page_off);
            let first_dirty = matches!(req.method(), AccessMethod::Write)
                && count > 0
                && !page.set_dirty(true);
            (count, first_dirty)
        };
        if first_dirty {
            newly_dirty.push(page_off);
        }
        req.complete_bytes(count);
    }

    /// An old-dirty write-back (plus merged neighbours) landed. The primary
    /// frame transitions toward loading its new offset: its blocked
    /// requests go back through the coordinator.
    fn writeback_complete(
        &self,
        frames: Vec<PageRef>,
        orig: Arc<OriginalRequest>,
        primary: usize,
    ) {
        let mut requeue: VecDeque<PendingOp> = VecDeque::new();
        for (i, page) in frames.into_iter().enumerate() {
            let drained = {
                let mut inner = page.lock();
                page.set_dirty(false);
                page.set_old_dirty(false);
                page.set_io_pending(false);
                page.set_prepare_writeback(false);
                std::mem::take(&mut inner.pending)
            };
            if i == primary {
                // The obligated thread's request for the new offset runs
                // first, then anything that queued behind it.
                requeue.push_back(PendingOp {
                    req: Arc::clone(&orig),
                    page,
                });
            }
            requeue.extend(drained);
            // Merged neighbours' pins release here.
        }
        self.pending.lock().append(&mut requeue);
    }

    /// A flush-engine write landed: the pages are clean again.
    fn flush_write_complete(&self, offset: u64, frames: Vec<PageRef>) {
        trace!(
            event = "flush_write_complete",
            offset,
            frames = frames.len()
        );
        for page in frames {
            let _inner = page.lock();
            debug_assert!(page.is_dirty());
            page.set_dirty(false);
            page.set_io_pending(false);
        }
    }
}

impl CompletionHandler<PageRef, CacheIoContext> for CachedIo {
    fn on_io_complete(&self, request: DiskRequest<PageRef, CacheIoContext>, result: Result<()>) {
        if let Err(err) = result {
            error!(
                event = "underlying_io_failed",
                offset = request.offset,
                method = ?request.method,
                error = %err
            );
            // Core invariants (dirty write-back in particular) assume the
            // store accepts our bytes; there is no recovery below this
            // layer.
            panic!("underlying I/O failed at offset {}: {err}", request.offset);
        }
        let DiskRequest {
            offset,
            frames,
            context,
            ..
        } = request;
        match context.0 {
            IoCtx::Flush => self.flush_write_complete(offset, frames),
            IoCtx::Read { orig } => self.read_fill_complete(offset, frames, &orig),
            IoCtx::Writeback { orig, primary } => self.writeback_complete(frames, orig, primary),
        }
        self.drain_pending();
    }
}

/// Claim a neighbouring page for write-back merging: must be dirty and not
/// already in flight. On failure the pin is kept by the caller to release.
fn claim_dirty(page: &PageRef) -> bool {
    let _inner = page.lock();
    if page.is_dirty() && !page.is_io_pending() {
        page.set_io_pending(true);
        true
    } else {
        false
    }
}

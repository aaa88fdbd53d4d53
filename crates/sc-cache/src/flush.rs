//! Background flush engine.
//!
//! A single worker consumes a bounded queue of dirty-enough buckets. For
//! each bucket it pins the flushable dirty pages, mints a single-page write
//! per page, then walks directory-adjacent buckets forward and backward,
//! extending each write with contiguous dirty neighbours. Only writes that
//! actually merged more than one page are submitted; a lone page is unwound
//! and left for a later cycle or for eviction-time write-back.

use crate::bucket::Bucket;
use crate::config::CacheConfig;
use crate::coordinator::{CacheIoContext, DynTransport, IoCtx};
use crate::page::PageRef;
use crate::table::AssociativeCache;
use parking_lot::{Condvar, Mutex};
use sc_error::Result;
use sc_io::{AccessMethod, DiskRequest};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

struct FlushShared {
    queue: Mutex<VecDeque<Arc<Bucket>>>,
    wake: Condvar,
    stop: AtomicBool,
    cache: Arc<AssociativeCache>,
    transport: Arc<DynTransport>,
    threshold: usize,
    capacity: usize,
    node_id: u32,
}

pub(crate) struct FlushEngine {
    shared: Arc<FlushShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// A write request under assembly: contiguous pinned dirty pages starting
/// at `start`.
struct WriteRun {
    start: u64,
    frames: Vec<PageRef>,
}

impl WriteRun {
    fn end(&self, page_size: u64) -> u64 {
        self.start + page_size * self.frames.len() as u64
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl FlushEngine {
    pub(crate) fn start(
        cache: Arc<AssociativeCache>,
        transport: Arc<DynTransport>,
        config: &CacheConfig,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(FlushShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            cache,
            transport,
            threshold: config.dirty_pages_threshold,
            capacity: config.flush_queue_len,
            node_id: config.node_id,
        });
        let worker_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("sc-flush".to_owned())
            .spawn(move || worker(&worker_shared))
            .map_err(sc_error::ScError::Io)?;
        Ok(Arc::new(Self {
            shared,
            join: Mutex::new(Some(join)),
        }))
    }

    /// Write-path callback: pages at `offsets` just became dirty. Buckets
    /// holding more than the threshold of flushable dirty pages are queued;
    /// when the queue is full the bucket is skipped and a later dirtying
    /// will pick it up.
    pub(crate) fn mark_dirty(&self, offsets: &[u64]) {
        let mut queued = 0;
        for &offset in offsets {
            let bucket = self.shared.cache.bucket_for_offset(offset);
            if bucket.is_in_queue() {
                continue;
            }
            if bucket.flushable_dirty() <= self.shared.threshold {
                continue;
            }
            if bucket.set_in_queue() {
                continue; // lost the race to another marker
            }
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                drop(queue);
                bucket.clear_in_queue();
                trace!(
                    event = "flush_queue_full",
                    bucket = bucket.index(),
                    capacity = self.shared.capacity
                );
                continue;
            }
            queue.push_back(bucket);
            queued += 1;
        }
        if queued > 0 {
            self.shared.wake.notify_one();
        }
    }

    /// Request shutdown and block until the worker exits. Queued buckets
    /// are drained first.
    pub(crate) fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Drop for FlushEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(shared: &Arc<FlushShared>) {
    loop {
        let bucket = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(bucket) = queue.pop_front() {
                    break bucket;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                shared.wake.wait(&mut queue);
            }
        };
        flush_bucket(shared, &bucket);
    }
}

fn flush_bucket(shared: &FlushShared, bucket: &Arc<Bucket>) {
    let page_size = shared.cache.page_size().bytes();

    // Pin the bucket's flushable dirty pages and mint one single-page write
    // per page. Pages that went into flight since collection just lose the
    // extra pin.
    let dirty = bucket.collect_dirty();
    let mut runs: Vec<WriteRun> = Vec::new();
    for (offset, page) in dirty {
        let claimed = {
            let _inner = page.lock();
            debug_assert!(!page.is_old_dirty());
            debug_assert!(page.is_data_ready());
            if page.is_io_pending() {
                false
            } else {
                page.set_io_pending(true);
                true
            }
        };
        if claimed {
            runs.push(WriteRun {
                start: offset,
                frames: vec![page],
            });
        }
    }
    let seeded = runs.len();
    if seeded == 0 {
        bucket.clear_in_queue();
        return;
    }

    // Forward pass: extend runs with dirty pages from successor buckets.
    let mut forward_done: Vec<WriteRun> = Vec::new();
    let mut current = Arc::clone(bucket);
    while !runs.is_empty() {
        let Some(next) = shared.cache.next_bucket(&current) else {
            break;
        };
        let mut neighbours = next.collect_dirty();
        merge_adjacent(
            &mut runs,
            &mut neighbours,
            page_size,
            Direction::Forward,
            &mut forward_done,
        );
        current = next;
    }
    forward_done.append(&mut runs);

    // Backward pass: the adjacent page becomes the new start of the run.
    let mut complete: Vec<WriteRun> = Vec::new();
    let mut pending = forward_done;
    let mut current = Arc::clone(bucket);
    while !pending.is_empty() {
        let Some(prev) = shared.cache.prev_bucket(&current) else {
            break;
        };
        let mut neighbours = prev.collect_dirty();
        merge_adjacent(
            &mut pending,
            &mut neighbours,
            page_size,
            Direction::Backward,
            &mut complete,
        );
        current = prev;
    }
    complete.append(&mut pending);

    let mut submitted = 0;
    for run in complete {
        if run.frames.len() > 1 {
            submitted += 1;
            let request = DiskRequest {
                offset: run.start,
                method: AccessMethod::Write,
                node_id: shared.node_id,
                frames: run.frames,
                context: CacheIoContext(IoCtx::Flush),
            };
            if let Err(err) = shared.transport.access(vec![request]) {
                error!(event = "flush_submit_failed", error = %err);
            }
        } else {
            // Not worth a device write on its own; unwind the claim.
            for page in run.frames {
                let _inner = page.lock();
                page.set_io_pending(false);
            }
        }
    }
    debug!(
        event = "flush_bucket",
        bucket = bucket.index(),
        seeded,
        submitted
    );
    bucket.clear_in_queue();
}

/// One merge step against a neighbour bucket's dirty pages. Runs that find
/// no adjacency (or whose adjacent page is already in flight) are retired
/// into `complete`; extended runs stay in `runs` for the next bucket.
fn merge_adjacent(
    runs: &mut Vec<WriteRun>,
    neighbours: &mut BTreeMap<u64, PageRef>,
    page_size: u64,
    direction: Direction,
    complete: &mut Vec<WriteRun>,
) {
    let mut i = 0;
    while i < runs.len() {
        let key = match direction {
            Direction::Forward => runs[i].end(page_size),
            Direction::Backward => match runs[i].start.checked_sub(page_size) {
                Some(key) => key,
                None => {
                    complete.push(runs.remove(i));
                    continue;
                }
            },
        };
        let Some(page) = neighbours.remove(&key) else {
            complete.push(runs.remove(i));
            continue;
        };
        let extended = {
            let _inner = page.lock();
            debug_assert!(!page.is_old_dirty());
            debug_assert!(page.is_data_ready());
            if page.is_io_pending() {
                false
            } else {
                page.set_io_pending(true);
                true
            }
        };
        if extended {
            match direction {
                Direction::Forward => runs[i].frames.push(page),
                Direction::Backward => {
                    runs[i].frames.insert(0, page);
                    runs[i].start = key;
                }
            }
            i += 1;
        } else {
            // The page is already being written back; cut the run here.
            complete.push(runs.remove(i));
        }
    }
    // Unmerged neighbour pins are released with the map.
}

//! Global page reserve.
//!
//! Buckets draw their frames from here at creation and expansion time. The
//! reserve also arbitrates expansion between caches: a cache may only grow
//! while it sits below the average per-cache share of the reserve.

use sc_error::{Result, ScError};
use sc_types::PageSize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct MemoryManager {
    page_size: PageSize,
    max_pages: usize,
    allocated: AtomicUsize,
    caches: AtomicUsize,
}

impl MemoryManager {
    #[must_use]
    pub fn new(max_bytes: usize, page_size: PageSize) -> Self {
        let max_pages = max_bytes / page_size.bytes() as usize;
        Self {
            page_size,
            max_pages,
            allocated: AtomicUsize::new(0),
            caches: AtomicUsize::new(0),
        }
    }

    pub fn register_cache(&self) {
        self.caches.fetch_add(1, Ordering::AcqRel);
    }

    /// Allocate `count` zeroed page frames, or fail with `OutOfMemory` when
    /// the reserve cannot cover them.
    pub fn allocate_frames(&self, count: usize) -> Result<Vec<Box<[u8]>>> {
        let prev = self.allocated.fetch_add(count, Ordering::AcqRel);
        if prev + count > self.max_pages {
            self.allocated.fetch_sub(count, Ordering::AcqRel);
            warn!(
                event = "page_reserve_exhausted",
                requested = count,
                allocated = prev,
                max_pages = self.max_pages
            );
            return Err(ScError::OutOfMemory {
                requested: count,
                available: self.max_pages.saturating_sub(prev),
            });
        }
        debug!(event = "frames_allocated", count, total = prev + count);
        let frame_len = self.page_size.bytes() as usize;
        Ok((0..count)
            .map(|_| vec![0_u8; frame_len].into_boxed_slice())
            .collect())
    }

    /// Return `count` pages to the reserve (frames discarded before they
    /// joined a bucket).
    pub fn release_frames(&self, count: usize) {
        self.allocated.fetch_sub(count, Ordering::AcqRel);
    }

    /// Bytes a single cache is entitled to before expansion stops.
    #[must_use]
    pub fn average_cache_size(&self) -> usize {
        let caches = self.caches.load(Ordering::Acquire).max(1);
        self.max_pages * self.page_size.bytes() as usize / caches
    }

    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }
}

//! Fixed-width page buckets.
//!
//! A bucket owns `cell_size` page frames, an eviction policy, and a short
//! spin-style lock protecting membership, hit counters and policy state.
//! Page state transitions taken here (re-targeting, the dirty to old-dirty
//! flip) happen under the bucket lock on pages whose refcount is zero, so no
//! holder can observe them mid-flight.

use crate::config::EvictionPolicyKind;
use crate::page::{Page, PageRef};
use crate::policy::{EvictChoice, PolicyState};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::trace;

const OVERFLOW: u8 = 1 << 0;
const IN_QUEUE: u8 = 1 << 1;

/// How an admitting lookup should treat a hot victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpandHint {
    /// The directory is not expandable; admit regardless.
    Disabled,
    /// Flag the bucket and hand control back so the caller may expand.
    Ask,
    /// Expansion was already attempted; flag the bucket but admit anyway.
    Forced,
}

/// Result of [`Bucket::admit`].
pub(crate) enum AdmitOutcome {
    /// The offset is already mapped (its data may still be loading).
    Hit(PageRef),
    /// A frame was re-targeted to the offset. `old_off` is the evicted
    /// page's prior offset, `None` when the frame was untouched.
    Fresh { page: PageRef, old_off: Option<u64> },
    /// Eviction hit a still-hot victim; the caller should consider growing
    /// the directory and then retry.
    NeedExpand,
    /// Every slot is referenced; back off outside the lock and retry.
    AllPinned,
}

pub(crate) struct BucketState {
    pub(crate) slots: Vec<Arc<Page>>,
    pub(crate) policy: PolicyState,
}

pub struct Bucket {
    index: usize,
    flags: AtomicU8,
    state: Mutex<BucketState>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("index", &self.index)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Bucket {
    pub(crate) fn new(
        index: usize,
        frames: Vec<Box<[u8]>>,
        policy: EvictionPolicyKind,
        node_id: u32,
    ) -> Self {
        let slots = frames
            .into_iter()
            .map(|frame| Arc::new(Page::new(frame, node_id)))
            .collect();
        Self {
            index,
            flags: AtomicU8::new(0),
            state: Mutex::new(BucketState {
                slots,
                policy: PolicyState::new(policy),
            }),
        }
    }

    /// Directory index of this bucket.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock()
    }

    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.flags.load(Ordering::Acquire) & OVERFLOW != 0
    }

    pub(crate) fn set_overflow(&self) {
        self.flags.fetch_or(OVERFLOW, Ordering::AcqRel);
    }

    pub(crate) fn clear_overflow(&self) {
        self.flags.fetch_and(!OVERFLOW, Ordering::AcqRel);
    }

    /// Mark the bucket as queued to the flush engine. Returns the previous
    /// state, so exactly one caller wins the enqueue.
    pub(crate) fn set_in_queue(&self) -> bool {
        self.flags.fetch_or(IN_QUEUE, Ordering::AcqRel) & IN_QUEUE != 0
    }

    pub(crate) fn clear_in_queue(&self) {
        self.flags.fetch_and(!IN_QUEUE, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_in_queue(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_QUEUE != 0
    }

    /// Existing-only search. Bumps the hit counter but, unlike an admitting
    /// lookup, does not touch policy recency state.
    pub(crate) fn find(&self, offset: u64) -> Option<PageRef> {
        let state = self.state.lock();
        let page = state
            .slots
            .iter()
            .find(|p| p.raw_offset() == offset as i64)?;
        if page.hits() == u8::MAX {
            scale_down_hits(&state.slots);
        }
        let page_ref = PageRef::acquire(page);
        page.hit();
        Some(page_ref)
    }

    /// Search for `offset`, admitting it into a frame on a miss.
    ///
    /// The new offset is published *before* the bucket lock is released, so
    /// later searchers immediately see the in-progress page.
    pub(crate) fn admit(&self, offset: u64, hint: ExpandHint) -> AdmitOutcome {
        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(idx) = state
            .slots
            .iter()
            .position(|p| p.raw_offset() == offset as i64)
        {
            state.policy.on_access(idx);
            let page = Arc::clone(&state.slots[idx]);
            if page.hits() == u8::MAX {
                scale_down_hits(&state.slots);
            }
            let page_ref = PageRef::acquire(&page);
            page.hit();
            return AdmitOutcome::Hit(page_ref);
        }

        let (slot, hot) = match state.policy.evict(&state.slots) {
            EvictChoice::Slot { slot, hot } => (slot, hot),
            EvictChoice::AllPinned => {
                trace!(event = "bucket_all_pinned", bucket = self.index);
                return AdmitOutcome::AllPinned;
            }
        };

        if hot && hint != ExpandHint::Disabled {
            self.set_overflow();
            if hint == ExpandHint::Ask {
                trace!(event = "bucket_overflow", bucket = self.index);
                return AdmitOutcome::NeedExpand;
            }
        }

        let victim = Arc::clone(&state.slots[slot]);
        debug_assert_eq!(victim.ref_count(), 0);
        if victim.is_dirty() && !victim.is_old_dirty() {
            victim.set_dirty(false);
            victim.set_old_dirty(true);
        }
        let old = victim.raw_offset();
        victim.set_offset(offset);
        victim.set_data_ready(false);
        if victim.hits() == u8::MAX {
            scale_down_hits(&state.slots);
        }
        let page_ref = PageRef::acquire(&victim);
        victim.hit();
        AdmitOutcome::Fresh {
            page: page_ref,
            old_off: u64::try_from(old).ok(),
        }
    }

    /// Pin and return the bucket's flushable dirty pages, keyed by offset.
    pub(crate) fn collect_dirty(&self) -> BTreeMap<u64, PageRef> {
        let state = self.state.lock();
        let mut pages = BTreeMap::new();
        for page in &state.slots {
            // Pages already being written back are left alone.
            if page.is_dirty() && !page.is_io_pending() {
                if let Some(offset) = page.offset() {
                    pages.insert(offset, PageRef::acquire(page));
                }
            }
        }
        pages
    }

    /// Count of dirty pages not currently in flight.
    #[must_use]
    pub fn flushable_dirty(&self) -> usize {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .filter(|p| p.is_dirty() && !p.is_io_pending())
            .count()
    }

    /// Spin until at least one slot is unreferenced. Used by admitting
    /// lookups after an [`AdmitOutcome::AllPinned`]; the condition is rare
    /// and brief.
    pub(crate) fn wait_any_unreferenced(&self) {
        loop {
            {
                let state = self.state.lock();
                if state.slots.iter().any(|p| p.ref_count() == 0) {
                    return;
                }
            }
            std::thread::yield_now();
        }
    }
}

fn scale_down_hits(slots: &[Arc<Page>]) {
    for page in slots {
        page.set_hits(page.hits() / 2);
    }
}

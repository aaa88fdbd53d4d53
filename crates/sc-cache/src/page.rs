//! Page frames and the reference-counted page handle.
//!
//! A [`Page`] is a fixed-size buffer plus the coordination state the cache
//! needs to serialize readers, writers, write-backs and evicted-dirty
//! handling. Flag and hit-counter words are atomics so the eviction path can
//! inspect them under the bucket lock alone; the data buffer and the
//! deferred-request queue sit behind the short-lived page lock.

use crate::request::OriginalRequest;
use parking_lot::{Mutex, MutexGuard};
use sc_types::INVALID_OFFSET;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};

/// Buffer content is authoritative for the page's offset.
pub(crate) const DATA_READY: u8 = 1 << 0;
/// Buffer has been modified since the last write-back.
pub(crate) const DIRTY: u8 = 1 << 1;
/// Buffer still holds a *previous* offset's dirty bytes pending write-back.
pub(crate) const OLD_DIRTY: u8 = 1 << 2;
/// A read or write for this frame is in flight.
pub(crate) const IO_PENDING: u8 = 1 << 3;
/// The flush engine has claimed the page for an upcoming write-back.
pub(crate) const PREPARE_WRITEBACK: u8 = 1 << 4;

/// A request deferred on a page while its I/O is in flight.
///
/// The embedded [`PageRef`] keeps the page pinned until the entry is drained
/// and reapplied.
pub(crate) struct PendingOp {
    pub(crate) req: Arc<OriginalRequest>,
    pub(crate) page: PageRef,
}

pub(crate) struct PageInner {
    pub(crate) data: Box<[u8]>,
    pub(crate) pending: VecDeque<PendingOp>,
}

/// One page frame.
pub struct Page {
    offset: AtomicI64,
    flags: AtomicU8,
    hits: AtomicU8,
    refs: AtomicI32,
    node_id: u32,
    inner: Mutex<PageInner>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("offset", &self.offset.load(Ordering::Relaxed))
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Page {
    pub(crate) fn new(frame: Box<[u8]>, node_id: u32) -> Self {
        Self {
            offset: AtomicI64::new(INVALID_OFFSET),
            flags: AtomicU8::new(0),
            hits: AtomicU8::new(0),
            refs: AtomicI32::new(0),
            node_id,
            inner: Mutex::new(PageInner {
                data: frame,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Byte offset this frame is mapped to, or `None` for an untouched frame.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        let raw = self.offset.load(Ordering::Acquire);
        u64::try_from(raw).ok()
    }

    pub(crate) fn raw_offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Re-target the frame. Callers hold the owning bucket's lock.
    pub(crate) fn set_offset(&self, offset: u64) {
        self.offset.store(offset as i64, Ordering::Release);
    }

    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    fn test_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn write_flag(&self, flag: u8, value: bool) -> bool {
        let prev = if value {
            self.flags.fetch_or(flag, Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel)
        };
        prev & flag != 0
    }

    #[must_use]
    pub fn is_data_ready(&self) -> bool {
        self.test_flag(DATA_READY)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.test_flag(DIRTY)
    }

    #[must_use]
    pub fn is_old_dirty(&self) -> bool {
        self.test_flag(OLD_DIRTY)
    }

    #[must_use]
    pub fn is_io_pending(&self) -> bool {
        self.test_flag(IO_PENDING)
    }

    pub(crate) fn set_data_ready(&self, value: bool) -> bool {
        self.write_flag(DATA_READY, value)
    }

    /// Returns the previous dirty state; the first setter forwards the page
    /// to the flush engine.
    pub(crate) fn set_dirty(&self, value: bool) -> bool {
        self.write_flag(DIRTY, value)
    }

    pub(crate) fn set_old_dirty(&self, value: bool) -> bool {
        self.write_flag(OLD_DIRTY, value)
    }

    pub(crate) fn set_io_pending(&self, value: bool) -> bool {
        self.write_flag(IO_PENDING, value)
    }

    pub(crate) fn set_prepare_writeback(&self, value: bool) -> bool {
        self.write_flag(PREPARE_WRITEBACK, value)
    }

    pub(crate) fn is_prepare_writeback(&self) -> bool {
        self.test_flag(PREPARE_WRITEBACK)
    }

    #[must_use]
    pub fn hits(&self) -> u8 {
        self.hits.load(Ordering::Acquire)
    }

    /// Mutated under the bucket lock only.
    pub(crate) fn set_hits(&self, hits: u8) {
        self.hits.store(hits, Ordering::Release);
    }

    /// Saturating hit bump; the bucket halves everyone when one saturates.
    pub(crate) fn hit(&self) {
        let hits = self.hits.load(Ordering::Acquire);
        self.hits.store(hits.saturating_add(1), Ordering::Release);
    }

    #[must_use]
    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Short critical-section lock over the buffer and deferred queue.
    ///
    /// Never acquired while holding a bucket lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PageInner> {
        self.inner.lock()
    }
}

/// An owned reference to a pinned page.
///
/// Minted only under the owning bucket's lock; dropping the handle releases
/// the pin. While any handle exists the page cannot be re-targeted, which is
/// what makes buffer contents stable for the holder.
pub struct PageRef {
    page: Arc<Page>,
}

impl PageRef {
    /// Pin `page`. The caller holds the owning bucket's lock.
    pub(crate) fn acquire(page: &Arc<Page>) -> Self {
        page.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            page: Arc::clone(page),
        }
    }

    /// A plain `Arc` to the page, carrying no pin of its own. Used to hold
    /// the page lock across a move of the `PageRef` itself (e.g. into a
    /// deferred-request queue).
    pub(crate) fn page_arc(&self) -> Arc<Page> {
        Arc::clone(&self.page)
    }
}

impl std::ops::Deref for PageRef {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PageRef").field(&*self.page).finish()
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let prev = self.page.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page refcount underflow");
    }
}

impl sc_io::Frame for PageRef {
    fn len(&self) -> usize {
        self.page.inner.lock().data.len()
    }

    fn load(&self, dst: &mut [u8]) {
        let inner = self.page.inner.lock();
        dst.copy_from_slice(&inner.data);
    }

    fn store(&self, src: &[u8]) {
        let mut inner = self.page.inner.lock();
        inner.data.copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Arc<Page> {
        Arc::new(Page::new(vec![0_u8; 4096].into_boxed_slice(), 0))
    }

    #[test]
    fn fresh_page_is_invalid() {
        let p = page();
        assert_eq!(p.offset(), None);
        assert!(!p.is_data_ready());
        assert!(!p.is_dirty());
        assert_eq!(p.ref_count(), 0);
    }

    #[test]
    fn flag_transitions_report_previous_state() {
        let p = page();
        assert!(!p.set_dirty(true));
        assert!(p.set_dirty(true));
        assert!(p.set_dirty(false));
        assert!(!p.set_dirty(false));
    }

    #[test]
    fn page_ref_pins_and_releases() {
        let p = page();
        let r1 = PageRef::acquire(&p);
        let r2 = PageRef::acquire(&p);
        assert_eq!(p.ref_count(), 2);
        drop(r1);
        assert_eq!(p.ref_count(), 1);
        drop(r2);
        assert_eq!(p.ref_count(), 0);
    }

    #[test]
    fn hits_saturate() {
        let p = page();
        p.set_hits(u8::MAX - 1);
        p.hit();
        assert_eq!(p.hits(), u8::MAX);
        p.hit();
        assert_eq!(p.hits(), u8::MAX);
    }

    #[test]
    fn frame_load_store_roundtrip() {
        use sc_io::Frame;

        let p = page();
        let r = PageRef::acquire(&p);
        r.store(&vec![0x5A_u8; 4096]);
        let mut out = vec![0_u8; 4096];
        r.load(&mut out);
        assert_eq!(out, vec![0x5A_u8; 4096]);
    }
}

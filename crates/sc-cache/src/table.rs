//! The associative cache directory.
//!
//! Maps page offsets onto buckets with linear hashing. The directory is a
//! two-level table: a vector of bucket groups, each `init_ncells` buckets
//! wide. Growth happens one bucket split at a time under an exclusive
//! expansion flag, while lookups keep running against the rest of the table.
//!
//! # Hashing
//!
//! With `size = 2^level * init_ncells` and `pidx = offset / page_size`:
//!
//! - `hash0 = pidx % size` indexes the current round's address space;
//! - `hash1 = pidx % (2 * size)` indexes the doubled space;
//! - buckets below `split` have already been split this round and are
//!   addressed through `hash1`.
//!
//! A page observed in the "wrong" bucket after a split is never returned as
//! a hit for another offset; the worst case is a cache miss plus a fresh
//! admission, and the stale copy is marked to age out quickly.

use crate::bucket::{AdmitOutcome, Bucket, ExpandHint};
use crate::config::{CacheConfig, EvictionPolicyKind};
use crate::manager::MemoryManager;
use crate::page::PageRef;
use parking_lot::RwLock;
use sc_error::Result;
use sc_types::PageSize;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

type BucketGroup = Vec<Arc<Bucket>>;

/// Outcome of an admitting lookup.
pub struct LookupResult {
    /// The pinned page, mapped to the requested offset.
    pub page: PageRef,
    /// Prior offset of the evicted frame; `Some` designates the caller as
    /// the unique thread responsible for any old-dirty write-back.
    pub old_off: Option<u64>,
    /// True when a frame was (re-)targeted rather than found.
    pub fresh: bool,
}

/// Point-in-time directory shape, for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub level: u32,
    pub split: usize,
    pub ncells: usize,
    pub size_bytes: usize,
}

pub struct AssociativeCache {
    page_size: PageSize,
    cell_size: usize,
    init_ncells: usize,
    expandable: bool,
    policy: EvictionPolicyKind,
    node_id: u32,
    manager: Arc<MemoryManager>,
    directory: RwLock<Vec<Arc<BucketGroup>>>,
    level: AtomicU32,
    split: AtomicUsize,
    ncells: AtomicUsize,
    expanding: AtomicBool,
}

impl std::fmt::Debug for AssociativeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociativeCache")
            .field("level", &self.level.load(Ordering::Relaxed))
            .field("split", &self.split.load(Ordering::Relaxed))
            .field("ncells", &self.ncells.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AssociativeCache {
    pub fn new(config: &CacheConfig, manager: Arc<MemoryManager>) -> Result<Self> {
        let page_size = config.page();
        let init_pages = config.effective_init_size() / page_size.bytes() as usize;
        let init_ncells = (init_pages / config.cell_size).max(1);

        let mut group = Vec::with_capacity(init_ncells);
        for index in 0..init_ncells {
            let frames = manager.allocate_frames(config.cell_size)?;
            group.push(Arc::new(Bucket::new(
                index,
                frames,
                config.policy,
                config.node_id,
            )));
        }
        manager.register_cache();
        info!(
            event = "cache_created",
            init_ncells,
            cell_size = config.cell_size,
            policy = ?config.policy,
            expandable = config.expandable
        );

        Ok(Self {
            page_size,
            cell_size: config.cell_size,
            init_ncells,
            expandable: config.expandable,
            policy: config.policy,
            node_id: config.node_id,
            manager,
            directory: RwLock::new(vec![Arc::new(group)]),
            level: AtomicU32::new(0),
            split: AtomicUsize::new(0),
            ncells: AtomicUsize::new(init_ncells),
            expanding: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn split(&self) -> usize {
        self.split.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ncells(&self) -> usize {
        self.ncells.load(Ordering::Acquire)
    }

    /// Bytes of page frames currently owned by the directory.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.ncells() * self.cell_size * self.page_size.bytes() as usize
    }

    #[must_use]
    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            level: self.level(),
            split: self.split(),
            ncells: self.ncells(),
            size_bytes: self.size_bytes(),
        }
    }

    /// Effective bucket index for a page index. Callers hold the directory
    /// read lock so `level`/`split` are read consistently.
    fn effective_index_locked(&self, pidx: u64) -> usize {
        let level = self.level.load(Ordering::Acquire);
        let split = self.split.load(Ordering::Acquire);
        let size = (1_usize << level) * self.init_ncells;
        let hash0 = (pidx % size as u64) as usize;
        if hash0 < split {
            (pidx % (2 * size) as u64) as usize
        } else {
            hash0
        }
    }

    /// The bucket currently responsible for `offset`.
    #[must_use]
    pub fn bucket_for_offset(&self, offset: u64) -> Arc<Bucket> {
        let directory = self.directory.read();
        let idx = self.effective_index_locked(self.page_size.page_index(offset));
        Arc::clone(&directory[idx / self.init_ncells][idx % self.init_ncells])
    }

    fn bucket_at(&self, idx: usize) -> Arc<Bucket> {
        let directory = self.directory.read();
        Arc::clone(&directory[idx / self.init_ncells][idx % self.init_ncells])
    }

    /// Existing-only search; the returned page is pinned.
    #[must_use]
    pub fn find(&self, offset: u64) -> Option<PageRef> {
        self.bucket_for_offset(offset).find(offset)
    }

    /// Search for `offset`, admitting it on a miss.
    ///
    /// Expansion restarts and pinned-bucket back-off are absorbed here; the
    /// call always returns a pinned page mapped to `offset`.
    pub fn lookup(&self, offset: u64) -> LookupResult {
        let mut tried_expand = false;
        loop {
            let bucket = self.bucket_for_offset(offset);
            let hint = if !self.expandable {
                ExpandHint::Disabled
            } else if tried_expand {
                ExpandHint::Forced
            } else {
                ExpandHint::Ask
            };
            match bucket.admit(offset, hint) {
                AdmitOutcome::Hit(page) => {
                    return LookupResult {
                        page,
                        old_off: None,
                        fresh: false,
                    };
                }
                AdmitOutcome::Fresh { page, old_off } => {
                    return LookupResult {
                        page,
                        old_off,
                        fresh: true,
                    };
                }
                AdmitOutcome::NeedExpand => {
                    // Admission control: only grow while below the per-cache
                    // share of the reserve.
                    if self.size_bytes() < self.manager.average_cache_size()
                        && self.expand(&bucket)
                    {
                        // The page may now hash elsewhere; restart clean.
                        continue;
                    }
                    tried_expand = true;
                }
                AdmitOutcome::AllPinned => bucket.wait_any_unreferenced(),
            }
        }
    }

    /// Grow the directory while `trigger` stays in overflow.
    ///
    /// Returns false when another thread is already expanding or when no
    /// split could be performed (e.g. the reserve is exhausted).
    pub fn expand(&self, trigger: &Arc<Bucket>) -> bool {
        if self.expanding.swap(true, Ordering::AcqRel) {
            return false;
        }
        let progressed = self.expand_rounds(trigger);
        self.expanding.store(false, Ordering::Release);
        progressed
    }

    fn expand_rounds(&self, trigger: &Arc<Bucket>) -> bool {
        let mut progressed = false;
        // Only this thread mutates level/split while the expanding flag is
        // held; plain loads are race-free here.
        while trigger.is_overflow() {
            let level = self.level.load(Ordering::Acquire);
            let split = self.split.load(Ordering::Acquire);
            let size = (1_usize << level) * self.init_ncells;
            let target_idx = split + size;
            if !self.ensure_capacity(target_idx) {
                // Out of memory: leave the directory as already published.
                return progressed;
            }

            let source = self.bucket_at(split);
            let target = self.bucket_at(target_idx);
            // Rehash and the split advance publish together: a lookup
            // either resolves against the old address space with the pages
            // still in place, or the new one with the pages moved.
            let wrapped = {
                let _directory = self.directory.write();
                self.rehash(&source, &target, size);
                if split + 1 == size {
                    self.level.store(level + 1, Ordering::Release);
                    self.split.store(0, Ordering::Release);
                    true
                } else {
                    self.split.store(split + 1, Ordering::Release);
                    false
                }
            };
            progressed = true;
            debug!(event = "cache_split", split, level, wrapped);
            if wrapped {
                info!(event = "cache_level_up", level = level + 1);
                break;
            }
        }
        progressed
    }

    /// Make sure bucket `target_idx` exists, allocating whole groups as
    /// needed. Returns false when the reserve cannot cover the growth.
    fn ensure_capacity(&self, target_idx: usize) -> bool {
        let group_idx = target_idx / self.init_ncells;
        let current = self.directory.read().len();
        if group_idx < current {
            return true;
        }

        let mut new_groups: Vec<Arc<BucketGroup>> = Vec::new();
        let mut failed = false;
        'groups: for g in current..=group_idx {
            let mut group = Vec::with_capacity(self.init_ncells);
            for j in 0..self.init_ncells {
                match self.manager.allocate_frames(self.cell_size) {
                    Ok(frames) => group.push(Arc::new(Bucket::new(
                        g * self.init_ncells + j,
                        frames,
                        self.policy,
                        self.node_id,
                    ))),
                    Err(err) => {
                        warn!(
                            event = "cache_expand_oom",
                            group = g,
                            error = %err
                        );
                        // Return the partial group's frames to the reserve.
                        self.manager.release_frames(group.len() * self.cell_size);
                        failed = true;
                        break 'groups;
                    }
                }
            }
            new_groups.push(Arc::new(group));
        }

        if !new_groups.is_empty() {
            let mut directory = self.directory.write();
            for group in new_groups {
                directory.push(group);
            }
            self.ncells
                .store(directory.len() * self.init_ncells, Ordering::Release);
        }
        !failed
    }

    /// One split step: move the source bucket's refcount-zero pages that now
    /// hash to the target. Both bucket locks are held, in ascending index
    /// order.
    fn rehash(&self, source: &Bucket, target: &Bucket, size: usize) {
        debug_assert!(source.index() < target.index());
        let mut src = source.lock_state();
        let mut dst = target.lock_state();
        let doubled = (2 * size) as u64;
        let mut free_slot = 0;
        for i in 0..src.slots.len() {
            let raw = src.slots[i].raw_offset();
            let Ok(offset) = u64::try_from(raw) else {
                continue; // untouched frame
            };
            let hash1 = (self.page_size.page_index(offset) % doubled) as usize;
            if hash1 == source.index() {
                continue;
            }
            if hash1 != target.index() {
                // Mapped here before an earlier level bump; a tolerated
                // miss. Make sure it is evicted soon.
                src.slots[i].set_hits(1);
                continue;
            }
            if src.slots[i].ref_count() != 0 {
                src.slots[i].set_hits(1);
                continue;
            }
            while free_slot < dst.slots.len() && dst.slots[free_slot].raw_offset() >= 0 {
                free_slot += 1;
            }
            if free_slot >= dst.slots.len() {
                break;
            }
            std::mem::swap(&mut src.slots[i], &mut dst.slots[free_slot]);
            free_slot += 1;
        }
        drop(dst);
        drop(src);
        source.clear_overflow();
        debug!(
            event = "bucket_rehash",
            source = source.index(),
            target = target.index()
        );
    }

    /// Directory-adjacent successor, or `None` at the table end.
    #[must_use]
    pub fn next_bucket(&self, bucket: &Bucket) -> Option<Arc<Bucket>> {
        let next = bucket.index() + 1;
        if next >= self.ncells() {
            None
        } else {
            Some(self.bucket_at(next))
        }
    }

    /// Directory-adjacent predecessor, or `None` at the table start.
    #[must_use]
    pub fn prev_bucket(&self, bucket: &Bucket) -> Option<Arc<Bucket>> {
        let index = bucket.index();
        if index == 0 {
            None
        } else {
            Some(self.bucket_at(index - 1))
        }
    }
}

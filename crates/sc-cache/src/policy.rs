//! Per-bucket eviction policies.
//!
//! A policy picks victim slots and maintains whatever auxiliary state it
//! needs (LRU recency order, CLOCK hand). All calls happen under the owning
//! bucket's lock, so policies may read page flags, hit counters and
//! refcounts directly.
//!
//! A policy never selects a referenced page. When every slot is pinned it
//! reports [`EvictChoice::AllPinned`] and the caller backs off outside the
//! lock.
//!
//! Each selection also carries a `hot` pressure signal: the victim still had
//! hits when the sweep reached it. The signal is computed before the sweep
//! consumes the counters (the CLOCK family only ever selects pages it has
//! already demoted to zero), and a hot victim is what asks the directory to
//! expand.

use crate::config::EvictionPolicyKind;
use crate::page::Page;
use sc_types::INVALID_OFFSET;
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EvictChoice {
    /// Evict the page in this slot. `hot` reports expansion pressure.
    Slot { slot: usize, hot: bool },
    /// Every slot is referenced; back off and retry.
    AllPinned,
}

impl EvictChoice {
    fn cold(slot: usize) -> Self {
        Self::Slot { slot, hot: false }
    }
}

#[derive(Debug)]
pub(crate) enum PolicyState {
    /// Recency order of slot indices; the tail is most recently used.
    Lru { order: Vec<usize> },
    Lfu,
    Fifo { hand: usize },
    Clock { hand: usize },
    GClock { hand: usize },
}

impl PolicyState {
    pub(crate) fn new(kind: EvictionPolicyKind) -> Self {
        match kind {
            EvictionPolicyKind::Lru => Self::Lru { order: Vec::new() },
            EvictionPolicyKind::Lfu => Self::Lfu,
            EvictionPolicyKind::Fifo => Self::Fifo { hand: 0 },
            EvictionPolicyKind::Clock => Self::Clock { hand: 0 },
            EvictionPolicyKind::GClock => Self::GClock { hand: 0 },
        }
    }

    /// Record a hit on `slot` during an admitting lookup.
    pub(crate) fn on_access(&mut self, slot: usize) {
        if let Self::Lru { order } = self {
            if let Some(pos) = order.iter().position(|s| *s == slot) {
                order.remove(pos);
            }
            order.push(slot);
        }
    }

    /// Pick a victim slot.
    pub(crate) fn evict(&mut self, slots: &[Arc<Page>]) -> EvictChoice {
        match self {
            Self::Lru { order } => evict_lru(order, slots),
            Self::Lfu => evict_lfu(slots),
            Self::Fifo { hand } => evict_fifo(hand, slots),
            Self::Clock { hand } => evict_clock(hand, slots, false),
            Self::GClock { hand } => evict_clock(hand, slots, true),
        }
    }
}

fn evict_lru(order: &mut Vec<usize>, slots: &[Arc<Page>]) -> EvictChoice {
    let slot = if order.len() < slots.len() {
        // Warm-up: hand out frames in slot order.
        order.len()
    } else {
        order[0]
    };
    if slots[slot].ref_count() > 0 {
        return EvictChoice::AllPinned;
    }
    let hot = slots[slot].hits() > 0;
    if let Some(pos) = order.iter().position(|s| *s == slot) {
        order.remove(pos);
    }
    // The victim becomes most recently used as it is re-targeted.
    order.push(slot);
    EvictChoice::Slot { slot, hot }
}

fn evict_lfu(slots: &[Arc<Page>]) -> EvictChoice {
    let mut best: Option<(usize, u8)> = None;
    for (i, page) in slots.iter().enumerate() {
        if page.ref_count() > 0 {
            continue;
        }
        let hits = page.hits();
        if best.is_none_or(|(_, best_hits)| hits < best_hits) {
            best = Some((i, hits));
            // A page never accessed before is a free victim.
            if hits == 0 {
                break;
            }
        }
    }
    match best {
        Some((slot, hits)) => {
            slots[slot].set_hits(0);
            EvictChoice::Slot {
                slot,
                hot: hits > 0,
            }
        }
        None => EvictChoice::AllPinned,
    }
}

fn evict_fifo(hand: &mut usize, slots: &[Arc<Page>]) -> EvictChoice {
    // Prefer a frame that has never held data.
    if let Some(slot) = slots
        .iter()
        .position(|p| p.raw_offset() == INVALID_OFFSET && p.ref_count() == 0)
    {
        return EvictChoice::cold(slot);
    }
    let len = slots.len();
    for step in 0..len {
        let slot = (*hand + step) % len;
        if slots[slot].ref_count() == 0 {
            *hand = (slot + 1) % len;
            return EvictChoice::Slot {
                slot,
                hot: slots[slot].hits() > 0,
            };
        }
    }
    EvictChoice::AllPinned
}

/// Shared CLOCK sweep. Plain CLOCK clears a passed-over page's hit counter
/// (one second chance); GCLOCK decrements it by one. Dirty pages are spared
/// on the first full sweep.
fn evict_clock(hand: &mut usize, slots: &[Arc<Page>], gclock: bool) -> EvictChoice {
    let len = slots.len();
    let mut num_referenced = 0;
    let mut num_dirty = 0;
    let mut avoid_dirty = true;
    let mut demoted = vec![false; len];
    loop {
        let slot = *hand % len;
        let page = &slots[slot];
        if num_dirty + num_referenced >= len {
            num_dirty = 0;
            num_referenced = 0;
            avoid_dirty = false;
        }
        if page.ref_count() > 0 {
            num_referenced += 1;
            if num_referenced >= len {
                return EvictChoice::AllPinned;
            }
            *hand = (*hand + 1) % len;
            continue;
        }
        if avoid_dirty && page.is_dirty() {
            num_dirty += 1;
            *hand = (*hand + 1) % len;
            continue;
        }
        if page.hits() == 0 {
            return EvictChoice::Slot {
                slot,
                hot: demoted[slot],
            };
        }
        if gclock {
            page.set_hits(page.hits() - 1);
        } else {
            page.set_hits(0);
        }
        demoted[slot] = true;
        *hand = (*hand + 1) % len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageRef;

    fn slots(n: usize) -> Vec<Arc<Page>> {
        (0..n)
            .map(|_| Arc::new(Page::new(vec![0_u8; 512].into_boxed_slice(), 0)))
            .collect()
    }

    fn victim(choice: EvictChoice) -> usize {
        match choice {
            EvictChoice::Slot { slot, .. } => slot,
            EvictChoice::AllPinned => panic!("unexpected AllPinned"),
        }
    }

    fn fill_lru(slots: &[Arc<Page>], policy: &mut PolicyState) {
        for (i, page) in slots.iter().enumerate() {
            let slot = victim(policy.evict(slots));
            assert_eq!(slot, i, "warm-up should hand out frames in order");
            page.set_offset(i as u64 * 4096);
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let slots = slots(4);
        let mut policy = PolicyState::new(EvictionPolicyKind::Lru);
        fill_lru(&slots, &mut policy);

        // Re-access slot 0; slot 1 becomes the LRU victim.
        policy.on_access(0);
        assert_eq!(victim(policy.evict(&slots)), 1);
    }

    #[test]
    fn lru_reports_pinned_victim() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::Lru);
        fill_lru(&slots, &mut policy);

        let pin = PageRef::acquire(&slots[0]);
        assert_eq!(policy.evict(&slots), EvictChoice::AllPinned);
        drop(pin);
        assert_eq!(victim(policy.evict(&slots)), 0);
    }

    #[test]
    fn lru_hot_victim_signals_pressure() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::Lru);
        fill_lru(&slots, &mut policy);
        slots[0].set_hits(2);

        assert_eq!(
            policy.evict(&slots),
            EvictChoice::Slot { slot: 0, hot: true }
        );
    }

    #[test]
    fn lfu_picks_minimum_hits_and_resets() {
        let slots = slots(3);
        let policy = &mut PolicyState::new(EvictionPolicyKind::Lfu);
        slots[0].set_hits(5);
        slots[1].set_hits(2);
        slots[2].set_hits(9);

        assert_eq!(
            policy.evict(&slots),
            EvictChoice::Slot { slot: 1, hot: true }
        );
        assert_eq!(slots[1].hits(), 0);
    }

    #[test]
    fn lfu_skips_referenced_pages() {
        let slots = slots(2);
        let policy = &mut PolicyState::new(EvictionPolicyKind::Lfu);
        slots[0].set_hits(0);
        slots[1].set_hits(7);
        let pin = PageRef::acquire(&slots[0]);

        assert_eq!(victim(policy.evict(&slots)), 1);
        drop(pin);
    }

    #[test]
    fn fifo_prefers_untouched_frames() {
        let slots = slots(3);
        let mut policy = PolicyState::new(EvictionPolicyKind::Fifo);
        slots[0].set_offset(0);

        assert_eq!(
            policy.evict(&slots),
            EvictChoice::Slot {
                slot: 1,
                hot: false
            }
        );
    }

    #[test]
    fn clock_spares_hit_pages_once() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::Clock);
        for (i, p) in slots.iter().enumerate() {
            p.set_offset(i as u64 * 4096);
        }
        slots[0].set_hits(3);
        slots[1].set_hits(1);

        // Both counters are cleared in passing; the hand wraps to slot 0,
        // which was demoted this sweep and so reports pressure.
        assert_eq!(
            policy.evict(&slots),
            EvictChoice::Slot { slot: 0, hot: true }
        );
        assert_eq!(slots[1].hits(), 0);
    }

    #[test]
    fn gclock_decrements_instead_of_clearing() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::GClock);
        for (i, p) in slots.iter().enumerate() {
            p.set_offset(i as u64 * 4096);
        }
        slots[0].set_hits(3);
        slots[1].set_hits(1);

        // Sweep: 3->2, 1->0, 2->1, then slot 1 is at zero.
        assert_eq!(
            policy.evict(&slots),
            EvictChoice::Slot { slot: 1, hot: true }
        );
        assert_eq!(slots[0].hits(), 1);
    }

    #[test]
    fn clock_cold_page_is_not_pressure() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::Clock);

        // Untouched frames evict without signalling expansion.
        assert_eq!(
            policy.evict(&slots),
            EvictChoice::Slot {
                slot: 0,
                hot: false
            }
        );
    }

    #[test]
    fn clock_avoids_dirty_on_first_sweep() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::Clock);
        for (i, p) in slots.iter().enumerate() {
            p.set_offset(i as u64 * 4096);
        }
        slots[0].set_dirty(true);

        assert_eq!(victim(policy.evict(&slots)), 1);
    }

    #[test]
    fn clock_reports_all_pinned() {
        let slots = slots(2);
        let mut policy = PolicyState::new(EvictionPolicyKind::Clock);
        let pins: Vec<_> = slots.iter().map(PageRef::acquire).collect();

        assert_eq!(policy.evict(&slots), EvictChoice::AllPinned);
        drop(pins);
    }
}

//! Page-Access Cache: a bounded LRU of kernel-virtual mappings onto arbitrary
//! physical frames, for code that needs a mapping to a frame the direct map
//! doesn't cover, or wants a scoped, type-safe temporary access.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::page::PhysAddr;

struct Slot {
    paddr: AtomicU64, // 0 == unmapped
    refcount: AtomicU32,
    generation: AtomicU64,
}

pub struct PageAccessCache {
    slots: Vec<Slot>,
    clock_hand: AtomicU64,
}

static PAC: spin::Once<PageAccessCache> = spin::Once::new();

pub fn init(slot_count: usize) {
    PAC.call_once(|| PageAccessCache {
        slots: (0..slot_count)
            .map(|_| Slot { paddr: AtomicU64::new(0), refcount: AtomicU32::new(0), generation: AtomicU64::new(0) })
            .collect(),
        clock_hand: AtomicU64::new(0),
    });
}

fn pac() -> &'static PageAccessCache {
    PAC.get().expect("pac::init not called")
}

/// Guard holding a live mapping to `paddr` for its lifetime. Multiple refs to
/// the same frame observe the same slot and bump a shared refcount.
pub struct PacRef {
    slot: usize,
    virt: u64,
}

impl PacRef {
    pub fn virt_addr(&self) -> u64 {
        self.virt
    }
}

impl Drop for PacRef {
    fn drop(&mut self) {
        pac().slots[self.slot].refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

const PAC_BASE: u64 = 0xFFFF_9000_0000_0000;

fn slot_virt(index: usize) -> u64 {
    PAC_BASE + (index as u64) * super::page::PAGE_SIZE as u64
}

/// Finds or installs a mapping for `paddr`, evicting an unreferenced slot by
/// round-robin clock if the cache is full. Never evicts a slot with a live
/// `PacRef`: the LRU's ref-count gating is what makes eviction safe.
pub fn access_page(paddr: PhysAddr) -> PacRef {
    let p = pac();

    for (i, slot) in p.slots.iter().enumerate() {
        if slot.paddr.load(Ordering::Acquire) == paddr {
            slot.refcount.fetch_add(1, Ordering::AcqRel);
            return PacRef { slot: i, virt: slot_virt(i) };
        }
    }

    loop {
        let hand = p.clock_hand.fetch_add(1, Ordering::Relaxed) as usize % p.slots.len();
        let slot = &p.slots[hand];
        if slot.refcount.load(Ordering::Acquire) != 0 {
            continue;
        }
        slot.paddr.store(paddr, Ordering::Release);
        slot.generation.fetch_add(1, Ordering::Relaxed);
        slot.refcount.store(1, Ordering::Release);
        // Host-side unit tests exercise the slot bookkeeping above without a
        // live PML4 to install real PTEs into.
        #[cfg(not(test))]
        crate::hal::hw_set_temp_map_slot(slot_virt(hand), paddr);
        return PacRef { slot: hand, virt: slot_virt(hand) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_access_to_same_frame_shares_a_slot() {
        init(4);
        let a = access_page(0x1000);
        let b = access_page(0x1000);
        assert_eq!(a.virt_addr(), b.virt_addr());
    }
}

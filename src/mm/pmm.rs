//! Physical memory: the single system domain's page-info database and its
//! free/active/dirty/standby lists. One domain is modeled (no NUMA), but the
//! list/lock shape leaves room for more without a redesign.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

use super::page::{pa_to_pfn, pfn_to_pa, PageInfo, PageRole, PhysAddr, Pfn, PAGE_SIZE};

pub struct UsableRange {
    pub base: PhysAddr,
    pub len: u64,
}

struct Domain {
    phys_offset: PhysAddr,
    pfndb: Vec<PageInfo>,
    free: Mutex<VecDeque<Pfn>>,
    active: Mutex<VecDeque<Pfn>>,
    dirty: Mutex<VecDeque<Pfn>>,
    standby: Mutex<VecDeque<Pfn>>,
    zero_page_pa: PhysAddr,
}

static DOMAIN: spin::Once<Domain> = spin::Once::new();

fn domain() -> &'static Domain {
    DOMAIN.get().expect("pmm::init not called")
}

/// Builds the page-info database over every usable range reported by the
/// boot loader and seeds the free list. `phys_offset` is the lowest usable
/// physical address; frames below it are never indexed.
pub fn init(ranges: &[UsableRange], phys_offset: PhysAddr) {
    DOMAIN.call_once(|| {
        let highest = ranges.iter().map(|r| r.base + r.len).max().unwrap_or(phys_offset);
        let npages = pa_to_pfn(highest - phys_offset) + 1;

        let mut pfndb = Vec::with_capacity(npages);
        for pfn in 0..npages {
            pfndb.push(PageInfo::new(pfn));
        }

        let mut free = VecDeque::new();
        for r in ranges {
            let start_pfn = pa_to_pfn(r.base - phys_offset);
            let end_pfn = pa_to_pfn(r.base + r.len - phys_offset);
            for pfn in start_pfn..end_pfn {
                free.push_back(pfn);
            }
        }
        let zero_page_pa = free.front().map(|&pfn| pfn_to_pa(pfn) + phys_offset).unwrap_or(phys_offset);

        Domain {
            phys_offset,
            pfndb,
            free: Mutex::new(free),
            active: Mutex::new(VecDeque::new()),
            dirty: Mutex::new(VecDeque::new()),
            standby: Mutex::new(VecDeque::new()),
            zero_page_pa,
        }
    });
}

pub fn lookup_page_info(paddr: PhysAddr) -> &'static PageInfo {
    let d = domain();
    &d.pfndb[pa_to_pfn(paddr - d.phys_offset)]
}

pub fn lookup_page_paddr(info: &PageInfo) -> PhysAddr {
    pfn_to_pa(info.pfn) + domain().phys_offset
}

pub fn zero_page_paddr() -> PhysAddr {
    domain().zero_page_pa
}

/// Pops a page off the free list. Returns `None` when exhausted; callers
/// decide whether that's fatal (`canFail` in the source contract maps to
/// the caller choosing to unwrap or propagate).
pub fn alloc_page() -> Option<PhysAddr> {
    let d = domain();
    let pfn = d.free.lock().pop_front()?;
    let info = &d.pfndb[pfn];
    info.get();
    Some(pfn_to_pa(pfn) + d.phys_offset)
}

pub fn free_page(paddr: PhysAddr) {
    let d = domain();
    let pfn = pa_to_pfn(paddr - d.phys_offset);
    let info = &d.pfndb[pfn];
    info.set_role(PageRole::Free { run_length: 1 });
    d.free.lock().push_back(pfn);
}

pub fn push_active(paddr: PhysAddr) {
    domain().active.lock().push_back(pa_to_pfn(paddr - domain().phys_offset));
}

pub fn pop_active() -> Option<PhysAddr> {
    let d = domain();
    d.active.lock().pop_front().map(|pfn| pfn_to_pa(pfn) + d.phys_offset)
}

pub fn push_dirty(paddr: PhysAddr) {
    domain().dirty.lock().push_back(pa_to_pfn(paddr - domain().phys_offset));
}

pub fn push_standby(paddr: PhysAddr) {
    domain().standby.lock().push_back(pa_to_pfn(paddr - domain().phys_offset));
}

pub fn pop_standby() -> Option<PhysAddr> {
    let d = domain();
    d.standby.lock().pop_front().map(|pfn| pfn_to_pa(pfn) + d.phys_offset)
}

pub fn active_snapshot() -> VecDeque<Pfn> {
    domain().active.lock().clone()
}

pub struct Stats {
    pub free: usize,
    pub active: usize,
    pub dirty: usize,
    pub standby: usize,
}

pub fn stats() -> Stats {
    let d = domain();
    Stats {
        free: d.free.lock().len(),
        active: d.active.lock().len(),
        dirty: d.dirty.lock().len(),
        standby: d.standby.lock().len(),
    }
}

pub const fn page_size() -> usize {
    PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_round_trips_through_the_free_list() {
        init(&[UsableRange { base: 0x10_0000, len: 16 * PAGE_SIZE as u64 }], 0x10_0000);
        let before = stats().free;
        let pa = alloc_page().expect("frame available");
        assert_eq!(stats().free, before - 1);
        free_page(pa);
        assert_eq!(stats().free, before);
    }
}

//! VM views, the address-space view tree, the demand-fault handler, and the
//! page-out daemon.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::RwLock;

use crate::lib::error::KernErr;

use super::page::{OverlayFlags, OwnerKind, PageRole, PhysAddr, PAGE_SIZE};
use super::pmm;
use super::vmo::{self, Vmo, VmoKind};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ViewFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

pub type ViewId = usize;

static NEXT_VIEW_ID: AtomicUsize = AtomicUsize::new(1);

pub struct View {
    pub id: ViewId,
    pub base: u64,
    pub length: u64,
    pub vmo: Option<Arc<Vmo>>,
    pub vmo_offset: u64,
    flags: spin::Mutex<ViewFlags>,
    overlay: spin::Mutex<BTreeMap<u64, PhysAddr>>,
    mdl_count: AtomicUsize,
}

impl View {
    pub fn flags(&self) -> ViewFlags {
        *self.flags.lock()
    }
}

/// Every live `View`, indexed by id, so a resident page's `owner_id` can be
/// turned back into the view (or, for a VMO-backed page, the set of views
/// attached to its object) when the page-out daemon needs to tear down
/// mappings before reclaiming a frame.
static VIEW_REGISTRY: spin::Mutex<BTreeMap<ViewId, Weak<View>>> = spin::Mutex::new(BTreeMap::new());

fn register_view(view: &Arc<View>) {
    VIEW_REGISTRY.lock().insert(view.id, Arc::downgrade(view));
}

fn unregister_view(id: ViewId) {
    VIEW_REGISTRY.lock().remove(&id);
}

fn lookup_view(id: ViewId) -> Option<Arc<View>> {
    VIEW_REGISTRY.lock().get(&id).and_then(Weak::upgrade)
}

/// Per-address-space reservation tracker plus the view tree it backs.
/// Address-space-wide mutations (AddView/Free/Split) take the tree's write
/// lock; per-view overlay access only needs the view's own lock.
pub struct AddressSpace {
    views: RwLock<BTreeMap<u64, Arc<View>>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace { views: RwLock::new(BTreeMap::new()) }
    }

    fn overlaps(existing: &BTreeMap<u64, Arc<View>>, base: u64, length: u64) -> bool {
        existing.values().any(|v| base < v.base + v.length && v.base < base + length)
    }

    /// Reserves `[base, base+length)`, links a new view referencing `vmo`
    /// (if any), and if `wire` is set, pages in and pins every page up front.
    pub fn add_view(
        &self,
        base: u64,
        length: u64,
        vmo: Option<Arc<Vmo>>,
        vmo_offset: u64,
        flags: ViewFlags,
        wire: bool,
    ) -> Result<Arc<View>, KernErr> {
        let mut tree = self.views.write();
        if Self::overlaps(&tree, base, length) {
            return Err(KernErr::AlreadyExists);
        }
        let view = Arc::new(View {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            base,
            length,
            vmo: vmo.clone(),
            vmo_offset,
            flags: spin::Mutex::new(flags),
            overlay: spin::Mutex::new(BTreeMap::new()),
            mdl_count: AtomicUsize::new(0),
        });
        if let Some(vmo) = &vmo {
            vmo.attach_view(view.id);
        }
        register_view(&view);
        tree.insert(base, view.clone());
        drop(tree);

        if wire {
            let mut offset = 0u64;
            while offset < length {
                wire_page(&view, offset, false)?;
                offset += PAGE_SIZE as u64;
            }
        }
        Ok(view)
    }

    fn find(&self, addr: u64) -> Option<Arc<View>> {
        self.views
            .read()
            .range(..=addr)
            .next_back()
            .map(|(_, v)| v.clone())
            .filter(|v| addr < v.base + v.length)
    }

    pub fn set_flags(&self, base: u64, flags: ViewFlags) -> Result<(), KernErr> {
        let tree = self.views.read();
        let view = tree.get(&base).ok_or(KernErr::NotFound)?;
        if view.mdl_count.load(Ordering::Acquire) != 0 {
            return Err(KernErr::PermissionDenied);
        }
        *view.flags.lock() = flags;
        Ok(())
    }

    /// Splits the view at `base` into two adjacent views at the given
    /// relative `offset`, both still referencing the original VMO.
    pub fn split(&self, base: u64, offset: u64) -> Result<(), KernErr> {
        let mut tree = self.views.write();
        let view = tree.get(&base).cloned().ok_or(KernErr::NotFound)?;
        if view.mdl_count.load(Ordering::Acquire) != 0 {
            return Err(KernErr::PermissionDenied);
        }
        if offset == 0 || offset >= view.length {
            return Err(KernErr::InvalidArgument);
        }
        let flags = view.flags();
        let mut overlay = view.overlay.lock();
        let tail_overlay: BTreeMap<u64, PhysAddr> =
            overlay.split_off(&offset).into_iter().map(|(k, v)| (k - offset, v)).collect();
        let head_overlay = core::mem::take(&mut *overlay);
        drop(overlay);

        let head = Arc::new(View {
            id: view.id,
            base: view.base,
            length: offset,
            vmo: view.vmo.clone(),
            vmo_offset: view.vmo_offset,
            flags: spin::Mutex::new(flags),
            overlay: spin::Mutex::new(head_overlay),
            mdl_count: AtomicUsize::new(0),
        });
        let tail = Arc::new(View {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            base: view.base + offset,
            length: view.length - offset,
            vmo: view.vmo.clone(),
            vmo_offset: view.vmo_offset + offset,
            flags: spin::Mutex::new(flags),
            overlay: spin::Mutex::new(tail_overlay),
            mdl_count: AtomicUsize::new(0),
        });
        if let Some(vmo) = &view.vmo {
            vmo.attach_view(tail.id);
        }
        register_view(&head);
        register_view(&tail);
        tree.insert(head.base, head);
        tree.insert(tail.base, tail);
        Ok(())
    }

    /// Detaches and unmaps a view, returning its hole to the allocator.
    pub fn free(&self, base: u64) -> Result<(), KernErr> {
        let mut tree = self.views.write();
        let view = tree.remove(&base).ok_or(KernErr::NotFound)?;
        if view.mdl_count.load(Ordering::Acquire) != 0 {
            return Err(KernErr::PermissionDenied);
        }
        unregister_view(view.id);
        if let Some(vmo) = &view.vmo {
            vmo.detach_view(view.id);
        }
        for (&offset, &paddr) in view.overlay.lock().iter() {
            unmap_range(view.base + offset, PAGE_SIZE);
            pmm::free_page(paddr);
        }
        Ok(())
    }
}

/// Tears down the PTE mapping for `[vaddr, vaddr+length)` and shoots it down
/// on every other online CPU — the view tree is address-space-wide, and a
/// view can be active in more than one CPU's TLB by the time it is freed.
fn unmap_range(vaddr: u64, length: usize) {
    let mut addr = vaddr;
    let end = vaddr + length as u64;
    while addr < end {
        unsafe {
            let _ = crate::hal::hw_unmap(addr);
        }
        crate::smp::flush_remote_tlbs(addr, PAGE_SIZE as u64);
        addr += PAGE_SIZE as u64;
    }
}

/// `HandlePageFault(addr, flags)`: runs at Passive IPL, called from the
/// architecture's page-fault trap handler.
pub fn handle_page_fault(space: &AddressSpace, addr: u64, flags: ViewFlags) -> Result<(), KernErr> {
    let view = space.find(addr).ok_or(KernErr::BadAddress)?;
    if !view.flags().contains(flags) {
        return Err(KernErr::PermissionDenied);
    }
    let offset = (addr - view.base) & !(PAGE_SIZE as u64 - 1);

    if flags == ViewFlags::READ && view.vmo.is_none() {
        map_zero_page(view.base + offset);
        return Ok(());
    }

    wire_page(&view, offset, flags.contains(ViewFlags::WRITE))?;
    Ok(())
}

/// Resolves the page backing `view` at `offset`, installing it if absent,
/// and records it on the domain's active list. `write` marks the page dirty
/// (new or already-resident) when this wire-in is on behalf of a write
/// access, so the page-out daemon knows to route it to the dirty list
/// instead of silently discarding it as clean.
fn wire_page(view: &Arc<View>, offset: u64, write: bool) -> Result<(), KernErr> {
    let mut overlay = view.overlay.lock();
    if let Some(&paddr) = overlay.get(&offset) {
        let info = pmm::lookup_page_info(paddr);
        info.get();
        if write {
            info.mark_dirty();
        }
        drop(overlay);
        pmm::push_active(paddr);
        return Ok(());
    }

    let dirty_flags = if write { OverlayFlags::DIRTY } else { OverlayFlags::empty() };
    let paddr = match &view.vmo {
        None => {
            let paddr = pmm::alloc_page().ok_or(KernErr::OutOfMemory)?;
            pmm::lookup_page_info(paddr).set_role(PageRole::Anonymous {
                owner_id: view.id,
                offset,
                wire_count: 1,
                flags: dirty_flags,
                owner: OwnerKind::ViewOverlay,
            });
            overlay.insert(offset, paddr);
            paddr
        }
        Some(vmo) if vmo.kind == VmoKind::Anonymous => {
            let vmo_offset = view.vmo_offset + offset;
            if let Some(paddr) = vmo.content_at(vmo_offset) {
                if write {
                    pmm::lookup_page_info(paddr).mark_dirty();
                }
                paddr
            } else {
                let paddr = pmm::alloc_page().ok_or(KernErr::OutOfMemory)?;
                pmm::lookup_page_info(paddr).set_role(PageRole::Anonymous {
                    owner_id: vmo.id,
                    offset: vmo_offset,
                    wire_count: 1,
                    flags: dirty_flags,
                    owner: OwnerKind::VmoContent,
                });
                vmo.insert_content(vmo_offset, paddr);
                paddr
            }
        }
        Some(vmo) if vmo.kind == VmoKind::Mmio => vmo.mmio_paddr_at(view.vmo_offset + offset),
        Some(_) => {
            // File-backed: would block on a wait entry until the pager
            // completes I/O. No pager is wired into this crate yet.
            return Err(KernErr::NotSupported);
        }
    };
    drop(overlay);

    install_pte(view.base + offset, paddr, view.flags());
    pmm::push_active(paddr);
    Ok(())
}

fn map_zero_page(vaddr: u64) {
    install_pte(vaddr, pmm::zero_page_paddr(), ViewFlags::READ);
}

fn install_pte(vaddr: u64, paddr: PhysAddr, flags: ViewFlags) {
    let pte_flags = crate::hal::PteFlags {
        writable: flags.contains(ViewFlags::WRITE),
        executable: flags.contains(ViewFlags::EXEC),
        user: flags.contains(ViewFlags::USER),
    };
    unsafe {
        let _ = crate::hal::hw_kernel_map(vaddr, paddr, pte_flags);
    }
    crate::hal::hw_flush_tlb_one(vaddr);
}

/// `AcquireMdl`/`ReleaseMdl`: pins a range resident and hands back the
/// physical segments, preventing reclaim for the MDL's lifetime.
pub struct Mdl {
    view: Arc<View>,
    pub segments: Vec<(PhysAddr, u64)>,
}

pub fn acquire_mdl(view: Arc<View>, base: u64, length: u64) -> Result<Mdl, KernErr> {
    let mut offset = base - view.base;
    let end = offset + length;
    let mut segments: Vec<(PhysAddr, u64)> = Vec::new();
    while offset < end {
        // An MDL pins memory for DMA-style access by a driver; the kernel
        // can't know in advance whether the transfer reads or writes, so it
        // is conservatively treated as a write for dirty tracking.
        wire_page(&view, offset & !(PAGE_SIZE as u64 - 1), true)?;
        let paddr = *view.overlay.lock().get(&(offset & !(PAGE_SIZE as u64 - 1))).ok_or(KernErr::BadAddress)?;
        match segments.last_mut() {
            Some((last_pa, last_len)) if *last_pa + *last_len == paddr => *last_len += PAGE_SIZE as u64,
            _ => segments.push((paddr, PAGE_SIZE as u64)),
        }
        offset += PAGE_SIZE as u64;
    }
    view.mdl_count.fetch_add(1, Ordering::AcqRel);
    Ok(Mdl { view, segments })
}

pub fn release_mdl(mdl: Mdl) {
    mdl.view.mdl_count.fetch_sub(1, Ordering::AcqRel);
}

/// Page-out daemon: a kernel thread per domain, woken on a timer or on
/// signalled pressure. Stage 1 always runs a second-chance clock sweep over
/// the active list; Stage 2 only reclaims from standby when pressure fired.
pub fn pageout_daemon(_arg: usize) {
    loop {
        run_one_pass(false);
        crate::hal::stall_for_ns(crate::config::pageout_wake_ms() * 1_000_000);
    }
}

/// Second-chance clock sweep: pops each page once off the front of the
/// active list (oldest first, since it was pushed on wire-in), unmaps it
/// from every view it's currently visible through (P3: no page on a
/// domain's standby list stays mapped anywhere), and routes it to dirty or
/// standby based on its tracked dirty bit.
fn run_one_pass(under_pressure: bool) {
    let candidates = pmm::active_snapshot().len();
    for _ in 0..candidates {
        let Some(paddr) = pmm::pop_active() else { break };
        let info = pmm::lookup_page_info(paddr);
        let dirty = info.with_role(|r| matches!(r, PageRole::Anonymous { flags, .. } if flags.contains(OverlayFlags::DIRTY)));

        unmap_resident_page(paddr);

        if dirty {
            pmm::push_dirty(paddr);
        } else {
            pmm::push_standby(paddr);
        }
    }

    if under_pressure {
        while let Some(paddr) = pmm::pop_standby() {
            unlink_resident_page(paddr);
            pmm::free_page(paddr);
        }
    }
}

/// Tears down every PTE mapping a resident anonymous page is currently
/// reachable through. A privately-owned page (`ViewOverlay`) has exactly
/// one; a VMO-backed page (`VmoContent`) may be visible through several
/// views sharing the object, so every attached view in range is unmapped.
fn unmap_resident_page(paddr: PhysAddr) {
    let info = pmm::lookup_page_info(paddr);
    let snapshot = info.with_role(|r| match r {
        PageRole::Anonymous { owner_id, offset, owner, .. } => Some((*owner_id, *offset, *owner)),
        _ => None,
    });
    let Some((owner_id, offset, owner)) = snapshot else { return };

    match owner {
        OwnerKind::ViewOverlay => {
            if let Some(view) = lookup_view(owner_id) {
                unmap_range(view.base + offset, PAGE_SIZE);
            }
        }
        OwnerKind::VmoContent => {
            if let Some(vmo) = vmo::lookup(owner_id) {
                for view_id in vmo.attached_views() {
                    let Some(view) = lookup_view(view_id) else { continue };
                    if offset < view.vmo_offset {
                        continue;
                    }
                    let rel = offset - view.vmo_offset;
                    if rel < view.length {
                        unmap_range(view.base + rel, PAGE_SIZE);
                    }
                }
            }
        }
        OwnerKind::None => {}
    }
}

/// Removes a reclaimed page's entry from its owning view's overlay (or its
/// VMO's content list) so a later fault re-allocates a fresh page instead of
/// handing back the stale, about-to-be-freed physical address.
fn unlink_resident_page(paddr: PhysAddr) {
    let info = pmm::lookup_page_info(paddr);
    let snapshot = info.with_role(|r| match r {
        PageRole::Anonymous { owner_id, offset, owner, .. } => Some((*owner_id, *offset, *owner)),
        _ => None,
    });
    let Some((owner_id, offset, owner)) = snapshot else { return };

    match owner {
        OwnerKind::ViewOverlay => {
            if let Some(view) = lookup_view(owner_id) {
                view.overlay.lock().remove(&offset);
            }
        }
        OwnerKind::VmoContent => {
            if let Some(vmo) = vmo::lookup(owner_id) {
                vmo.remove_content(offset);
            }
        }
        OwnerKind::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_cannot_overlap() {
        let space = AddressSpace::new();
        space.add_view(0x1000, PAGE_SIZE as u64, None, 0, ViewFlags::READ | ViewFlags::WRITE, false).unwrap();
        let err = space.add_view(0x1000, PAGE_SIZE as u64, None, 0, ViewFlags::READ, false).unwrap_err();
        assert_eq!(err, KernErr::AlreadyExists);
    }

    #[test]
    fn split_produces_two_adjacent_views() {
        let space = AddressSpace::new();
        space.add_view(0x2000, 3 * PAGE_SIZE as u64, None, 0, ViewFlags::READ, false).unwrap();
        space.split(0x2000, PAGE_SIZE as u64).unwrap();
        assert!(space.set_flags(0x2000, ViewFlags::READ | ViewFlags::WRITE).is_ok());
        assert!(space.set_flags(0x3000, ViewFlags::READ | ViewFlags::WRITE).is_ok());
    }
}

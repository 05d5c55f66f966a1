//! VM objects: page-granular named providers of backing memory, referenced
//! by one or more views.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::page::PhysAddr;

/// Every live `Vmo`, indexed by id, so the page-out daemon can walk from a
/// resident page's `owner_id` back to the object and fan out to its views
/// without the page descriptor itself holding a strong reference.
static VMO_REGISTRY: spin::Mutex<BTreeMap<VmoId, Weak<Vmo>>> = spin::Mutex::new(BTreeMap::new());

pub fn lookup(id: VmoId) -> Option<Arc<Vmo>> {
    VMO_REGISTRY.lock().get(&id).and_then(Weak::upgrade)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmoKind {
    Anonymous,
    File,
    Mmio,
}

pub type VmoId = usize;

struct VmoState {
    content: BTreeMap<u64, PhysAddr>,
    views: Vec<usize>, // opaque view ids, for SetFlags/Free fan-out
}

pub struct Vmo {
    pub id: VmoId,
    pub kind: VmoKind,
    pub length_pages: u64,
    state: spin::Mutex<VmoState>,
    refcount: AtomicUsize,
    mmio_base: PhysAddr,
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

impl Vmo {
    pub fn new_anonymous(length_pages: u64) -> Arc<Vmo> {
        Self::new(VmoKind::Anonymous, length_pages, 0)
    }

    pub fn new_mmio(base: PhysAddr, length_pages: u64) -> Arc<Vmo> {
        Self::new(VmoKind::Mmio, length_pages, base)
    }

    fn new(kind: VmoKind, length_pages: u64, mmio_base: PhysAddr) -> Arc<Vmo> {
        let vmo = Arc::new(Vmo {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            length_pages,
            state: spin::Mutex::new(VmoState { content: BTreeMap::new(), views: Vec::new() }),
            refcount: AtomicUsize::new(1),
            mmio_base,
        });
        VMO_REGISTRY.lock().insert(vmo.id, Arc::downgrade(&vmo));
        vmo
    }

    pub fn content_at(&self, offset: u64) -> Option<PhysAddr> {
        self.state.lock().content.get(&offset).copied()
    }

    pub fn insert_content(&self, offset: u64, paddr: PhysAddr) {
        self.state.lock().content.insert(offset, paddr);
    }

    pub fn remove_content(&self, offset: u64) -> Option<PhysAddr> {
        self.state.lock().content.remove(&offset)
    }

    pub fn attach_view(&self, view_id: usize) {
        self.state.lock().views.push(view_id);
    }

    pub fn detach_view(&self, view_id: usize) {
        self.state.lock().views.retain(|&v| v != view_id);
    }

    /// Snapshot of every view id currently attached, for fanning out an
    /// unmap across every view a shared page is visible through.
    pub fn attached_views(&self) -> Vec<usize> {
        self.state.lock().views.clone()
    }

    /// MMIO VMOs have no resident-page tracking; the physical address for a
    /// given offset is computed directly from the object's mapping base.
    pub fn mmio_paddr_at(&self, offset: u64) -> PhysAddr {
        debug_assert_eq!(self.kind, VmoKind::Mmio);
        self.mmio_base + offset
    }

    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn put(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_vmo_starts_with_no_resident_pages() {
        let v = Vmo::new_anonymous(4);
        assert_eq!(v.content_at(0), None);
    }

    #[test]
    fn mmio_offset_resolves_from_base() {
        let v = Vmo::new_mmio(0xFEE0_0000, 1);
        assert_eq!(v.mmio_paddr_at(0x10), 0xFEE0_0010);
    }
}

//! Per-domain address space: the view tree plus the ASLR-randomized base
//! addresses new views are carved from.

use super::aslr::{self, AslrConfig};
use super::view::AddressSpace as ViewTree;

pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;
pub const USER_HEAP_START: u64 = 0x0000_5555_5600_0000;
pub const USER_MMAP_BASE: u64 = 0x0000_7000_0000_0000;

/// Bundles the view tree with the three randomized region bases a freshly
/// created address space starts from.
pub struct AddressSpace {
    pub views: ViewTree,
    pub stack_top: u64,
    pub heap_start: u64,
    pub mmap_base: u64,
}

impl AddressSpace {
    pub fn new() -> Self {
        let config = AslrConfig::default();
        AddressSpace {
            views: ViewTree::new(),
            stack_top: aslr::randomize_stack_top(&config),
            heap_start: aslr::randomize_heap_start(&config),
            mmap_base: aslr::randomize_mmap_base(&config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_address_space_has_no_views() {
        let space = AddressSpace::new();
        let err = space.views.set_flags(space.stack_top, super::super::view::ViewFlags::READ);
        assert_eq!(err.unwrap_err(), crate::lib::error::KernErr::NotFound);
    }
}

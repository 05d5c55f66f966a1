#![no_std]
#![no_main]
#![feature(alloc_error_handler)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(feature = "strict", deny(warnings))]

extern crate alloc;

#[allow(special_module_name)]
pub mod lib;

pub mod arch {
    pub mod x86_64;
    pub use x86_64::*;
}

pub mod hal;
pub mod ipl;
pub mod dpc;
pub mod clock;
pub mod config;
pub mod mm;
pub mod sched;
pub mod wait;
pub mod smp;
pub mod heap;
pub mod build_info;
pub mod prng;

use bootloader_api::config::{BootloaderConfig, Mapping};
use bootloader_api::{entry_point, BootInfo};

/// Direct-map base the bootloader is asked to map all physical memory at.
/// Must match `arch::x86_64::paging::PHYS_MEM_OFFSET`.
const PHYS_MEM_OFFSET: u64 = 0xFFFF_FFFF_8000_0000;

static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::FixedAddress(PHYS_MEM_OFFSET));
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    if let Err(e) = arch::x86_64::boot::validate_hardware() {
        arch::x86_64::serial::serial_write(b"\n[FATAL] hardware validation: ");
        arch::x86_64::serial::serial_write(e.as_bytes());
        arch::x86_64::serial::serial_write(b"\n");
        arch::x86_64::boot::halt_forever();
    }

    unsafe {
        if let Err(e) = arch::x86_64::arch_early_init() {
            arch::x86_64::serial::serial_write(b"\n[FATAL] early init: ");
            arch::x86_64::serial::serial_write(e.as_bytes());
            arch::x86_64::serial::serial_write(b"\n");
            arch::x86_64::boot::halt_forever();
        }
    }

    if let Err(e) = heap::init_heap() {
        arch::x86_64::serial::serial_write(b"[FATAL] heap init: ");
        arch::x86_64::serial::serial_write(e.as_bytes());
        arch::x86_64::serial::serial_write(b"\n");
        arch::x86_64::boot::halt_forever();
    }

    // No command-line passed by this bootloader; defaults apply until a
    // config source (ramdisk, ACPI vendor table) is wired in.
    config::init("");

    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .unwrap_or(PHYS_MEM_OFFSET);

    let ranges: alloc::vec::Vec<mm::pmm::UsableRange> = boot_info
        .memory_regions
        .iter()
        .filter(|r| r.kind == bootloader_api::info::MemoryRegionKind::Usable)
        .map(|r| mm::pmm::UsableRange { base: r.start, len: r.end - r.start })
        .collect();
    mm::pmm::init(&ranges, phys_offset);
    mm::pac::init(config::pac_slot_count() as usize);

    unsafe {
        arch::x86_64::percpu::init_bsp();
        let _ = arch::x86_64::apic::init();
    }
    smp::init_bsp_core();

    sched::init_bsp();

    arch::x86_64::boot::print_boot_info();
    build_info::print_build_info();
    arch::x86_64::serial::serial_write(b"[BOOT] kernel core ready\n");

    loop {
        hal::wait_for_intr();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::lib::panic::panic_handler(info)
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("allocation failure: {:?}", layout)
}

/// Early-boot and panic-path console output. Every subsystem that needs to
/// print before (or during) a crash goes through this, not the logging
/// pipeline, since the heap and scheduler may not be usable yet.
#[inline(always)]
pub(crate) unsafe fn uart_print(msg: &[u8]) {
    arch::x86_64::serial::serial_write(msg);
}

#[macro_export]
macro_rules! kprint {
    ($($t:tt)*) => {{
        let s = alloc::format!($($t)*);
        #[allow(unused_unsafe)]
        unsafe { crate::uart_print(s.as_bytes()); }
    }};
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($t:tt)*) => { $crate::kprint!("{}\n", format_args!($($t)*)) };
}

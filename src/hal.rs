//! Hardware abstraction facade.
//!
//! Every other module in the five core subsystems (`ipl`, `dpc`, `clock`,
//! `sched`, `mm`, `wait`) reaches hardware only through this file. It is a
//! thin wrapper over `arch::x86_64::*`; porting to a second architecture
//! means rewriting this file and nothing upstream of it.

use crate::arch::x86_64 as arch;
use crate::arch::x86_64::apic::{self, IpiDestination, IpiType};
use crate::arch::x86_64::idt;
use crate::arch::x86_64::paging::PageTableManager;
use crate::arch::x86_64::percpu::CpuLocal;
use crate::arch::x86_64::tsc;
use x86_64::instructions::interrupts;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr as X64PhysAddr, VirtAddr as X64VirtAddr};

/// Logical CPU index of the running CPU, stable for its lifetime. Used to
/// index every per-CPU array in the kernel core.
#[inline]
pub fn my_core_id() -> u32 {
    CpuLocal::current().cpu_id
}

/// The GS-anchored HAL-level per-CPU block for the running CPU. Distinct
/// from `crate::smp::CoreBlock`, which holds the kernel-core's own per-CPU
/// state (IPL slot, DPC queue, clock list, run queue) and is looked up by
/// `my_core_id()` instead of GS.
#[inline]
pub fn my_cpu_locals() -> &'static CpuLocal {
    CpuLocal::current()
}

/// The native page size. Fixed at 4 KiB; huge pages are not modeled.
pub const PAGE_SIZE: usize = 4096;

/// Returns whether interrupts are currently enabled on this CPU.
#[inline]
pub fn intrs_enabled() -> bool {
    interrupts::are_enabled()
}

/// Disables interrupts, returning the prior enabled state.
#[inline]
pub fn intrs_off() -> bool {
    let was_on = intrs_enabled();
    interrupts::disable();
    was_on
}

/// Enables interrupts, returning the prior enabled state.
#[inline]
pub fn intrs_on() -> bool {
    let was_on = intrs_enabled();
    interrupts::enable();
    was_on
}

/// Sets the interrupt-enable flag to exactly `on`, returning the prior state.
#[inline]
pub fn intrs_exchange(on: bool) -> bool {
    if on { intrs_on() } else { intrs_off() }
}

/// Parks the CPU until the next interrupt, with interrupts enabled for the
/// duration of the wait (the classic `sti; hlt` idiom, race-free because the
/// `sti` and `hlt` are a single uninterruptible instruction pair).
#[inline]
pub fn wait_for_intr() {
    interrupts::enable_and_hlt();
}

/// Switches the running thread's machine context from `prev` to `next`.
///
/// # Safety
/// See `arch::x86_64::context::switch_to`.
#[inline]
pub unsafe fn hw_switch_thread(prev: *mut arch::CpuContext, next: *const arch::CpuContext) {
    arch::switch_to(prev, next);
}

/// Builds the initial machine context for a kernel thread that has never run.
pub fn hw_prime_thread(stack_top: u64, entry: extern "C" fn(usize) -> !, arg: usize) -> arch::CpuContext {
    arch::prime_kernel_context(stack_top, entry, arg)
}

/// Sends an IPI to bring another CPU out of `WaitForIntr` or to deliver a
/// fixed vector (reschedule, TLB shootdown, mailbox, halt).
pub fn hw_send_ipi(target_cpu_id: u32, vector: u8) {
    unsafe {
        let guard = apic::get();
        if let Some(guard) = guard {
            if let Some(lapic) = guard.as_ref() {
                let apic_id = crate::smp::apic_id_for(target_cpu_id);
                lapic.send_ipi(IpiDestination::Physical(apic_id), IpiType::Fixed(vector));
            }
        }
    }
}

/// Broadcasts a fixed vector to every CPU except the caller (panic halt,
/// global TLB shootdown with no precise target set).
pub fn hw_broadcast_ipi(vector: u8) {
    unsafe {
        let guard = apic::get();
        if let Some(guard) = guard {
            if let Some(lapic) = guard.as_ref() {
                lapic.send_ipi(IpiDestination::AllExcludingSelf, IpiType::Fixed(vector));
            }
        }
    }
}

/// Invalidates the TLB entry for `virt_addr` on the local CPU.
#[inline]
pub fn hw_flush_tlb_one(virt_addr: u64) {
    arch::invlpg(virt_addr);
}

/// Invalidates the entire TLB on the local CPU (CR3 reload).
#[inline]
pub fn hw_flush_tlb_all() {
    arch::flush_tlb();
}

/// Access permissions for a single PTE install, decoupled from `mm::view`'s
/// own `ViewFlags` so this file stays below `mm` in the dependency order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PteFlags {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
}

fn pte_flags_to_raw(flags: PteFlags) -> PageTableFlags {
    let mut raw = PageTableFlags::PRESENT;
    if flags.writable {
        raw |= PageTableFlags::WRITABLE;
    }
    if flags.user {
        raw |= PageTableFlags::USER_ACCESSIBLE;
    }
    if !flags.executable {
        raw |= PageTableFlags::NO_EXECUTE;
    }
    raw
}

/// Lazily wraps the PML4 active at the time of first use (the BSP's kernel
/// map, installed by the boot loader) so every caller shares one manager
/// rather than re-reading CR3 per call.
static KERNEL_MAP: spin::Once<spin::Mutex<PageTableManager>> = spin::Once::new();

fn kernel_map() -> &'static spin::Mutex<PageTableManager> {
    KERNEL_MAP.call_once(|| {
        spin::Mutex::new(unsafe { PageTableManager::new() }.expect("no active PML4 at HAL init"))
    })
}

/// Installs (or replaces) a PTE mapping `vaddr` to `paddr` in the kernel's
/// address space, flushing the local TLB for `vaddr`. Idempotent: an
/// existing mapping at `vaddr` is torn down first rather than erroring, since
/// callers (the PAC's slot remap, the VMM's fault handler) both expect a
/// plain "make this virtual address point here now" primitive.
///
/// # Safety
/// `paddr` must name a frame the caller is entitled to map; a stale mapping
/// elsewhere pointing at the same frame with incompatible flags is the
/// caller's responsibility to avoid.
pub unsafe fn hw_kernel_map(vaddr: u64, paddr: u64, flags: PteFlags) -> Result<(), &'static str> {
    let mut map = kernel_map().lock();
    let virt = X64VirtAddr::new(vaddr);
    let _ = map.unmap_page(virt);
    map.map_page(virt, X64PhysAddr::new(paddr), pte_flags_to_raw(flags))
}

/// Removes the PTE mapping `vaddr` from the kernel's address space, returning
/// the physical address it pointed at. Does not free the frame.
///
/// # Safety
/// See `hw_kernel_map`.
pub unsafe fn hw_unmap(vaddr: u64) -> Result<u64, &'static str> {
    let mut map = kernel_map().lock();
    map.unmap_page(X64VirtAddr::new(vaddr)).map(|p| p.as_u64())
}

/// Resolves `vaddr` to its mapped physical address, or `None` if unmapped.
///
/// # Safety
/// See `hw_kernel_map`.
pub unsafe fn hw_walk_map(vaddr: u64) -> Option<u64> {
    let map = kernel_map().lock();
    map.translate(X64VirtAddr::new(vaddr)).map(|p| p.as_u64())
}

/// Points the PAC's temporary-mapping slot `index` at `paddr` and flushes the
/// local TLB for that slot, per the HAL surface §6 names `HwSetTempMapSlot`.
/// `vaddr` is the slot's fixed virtual address, chosen by the caller (the
/// PAC owns the slot-to-address layout; this just installs the PTE).
pub fn hw_set_temp_map_slot(vaddr: u64, paddr: u64) {
    unsafe {
        let _ = hw_kernel_map(vaddr, paddr, PteFlags { writable: true, executable: false, user: false });
    }
    hw_flush_tlb_one(vaddr);
}

/// Monotonic nanoseconds since boot, derived from the calibrated TSC.
#[inline]
pub fn hw_read_timestamp() -> u64 {
    tsc::tsc_to_ns(tsc::read_tsc())
}

/// Busy-waits for approximately `ns` nanoseconds. Used only for very short,
/// sub-scheduling-quantum delays (e.g. IPI delivery spin-waits); anything
/// longer belongs on the clock event list instead.
pub fn stall_for_ns(ns: u64) {
    let target = tsc::read_tsc() + tsc::ns_to_tsc(ns);
    while tsc::read_tsc() < target {
        core::hint::spin_loop();
    }
}

/// Arms the local APIC's one-shot timer so it fires at or shortly after
/// `expiry` (nanoseconds since boot). A past or immediate expiry still arms
/// for the shortest representable interval rather than firing synchronously,
/// so callers always observe delivery through `clock::on_alarm_fired`.
pub fn hw_set_alarm(expiry: u64) {
    let now = hw_read_timestamp();
    let delta_ns = expiry.saturating_sub(now).max(1);
    let ticks = apic_ticks_for_ns(delta_ns).max(1);
    unsafe {
        let guard = apic::get();
        if let Some(guard) = guard {
            if let Some(lapic) = guard.as_ref() {
                lapic.configure_timer(idt::TIMER_VECTOR, ticks, 16, false);
            }
        }
    }
}

/// Calibrated APIC-timer ticks-per-nanosecond, computed once against the TSC.
static APIC_TICKS_PER_US: spin::Once<u64> = spin::Once::new();

fn apic_ticks_for_ns(ns: u64) -> u32 {
    let per_us = *APIC_TICKS_PER_US.call_once(calibrate_apic_timer);
    (((ns / 1000).max(1)) * per_us).min(u32::MAX as u64) as u32
}

/// Calibrates the local APIC timer's tick rate (divisor 16) against the TSC
/// by running it down for ~1ms and measuring how far the count fell.
fn calibrate_apic_timer() -> u64 {
    const INITIAL: u32 = 0xFFFF_FFFF;
    unsafe {
        let guard = apic::get();
        let Some(guard) = guard else { return 1 };
        let Some(lapic) = guard.as_ref() else { return 1 };

        lapic.configure_timer(idt::TIMER_VECTOR, INITIAL, 16, false);
        let start_tsc = tsc::read_tsc();
        let target_tsc = start_tsc + tsc::ns_to_tsc(1_000_000);
        while tsc::read_tsc() < target_tsc {
            core::hint::spin_loop();
        }
        let remaining = lapic.timer_current_count();
        let consumed = INITIAL.saturating_sub(remaining) as u64;
        (consumed / 1000).max(1)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn page_size_is_4k() {
        assert_eq!(super::PAGE_SIZE, 4096);
    }
}

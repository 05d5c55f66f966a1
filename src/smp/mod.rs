//! Per-CPU control blocks, inter-CPU mail, and TLB shootdown.
//!
//! This is the kernel-core's own per-CPU registry, indexed by the logical
//! `cpu_id` returned from `hal::my_core_id()`. It is deliberately separate
//! from `arch::x86_64::percpu::CpuLocal`, the GS-anchored HAL-level anchor:
//! `CpuLocal` is a raw, ASM-offset-sensitive struct the HAL reads from
//! assembly; `CoreBlock` is ordinary Rust state (mailboxes, shootdown queue,
//! online flag) the core reaches through a plain array lookup.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::arch::x86_64::idt;
use crate::hal;
use crate::ipl::{Ipl, IplLock};

/// Upper bound on logical CPUs this build supports. Arrays below are sized
/// to this at compile time; raising it is the only change needed to support
/// more cores.
pub const MAX_CPUS: usize = 32;

/// A pending remote TLB invalidation request. `acks` counts down as each
/// targeted CPU finishes invalidating; the requester spins on it to know
/// when every target has caught up (§4 SMP, TLB shootdown).
pub struct RemoteFlushData {
    base: u64,
    length: u64,
    acks: AtomicU32,
}

enum Mail {
    Call(fn(usize), usize),
}

struct CoreBlock {
    apic_id: AtomicU32,
    online: AtomicBool,
    mail: IplLock<VecDeque<Mail>>,
    shootdowns: IplLock<VecDeque<&'static RemoteFlushData>>,
}

impl CoreBlock {
    const fn new() -> Self {
        CoreBlock {
            apic_id: AtomicU32::new(0),
            online: AtomicBool::new(false),
            mail: IplLock::new(Ipl::Interrupt, VecDeque::new()),
            shootdowns: IplLock::new(Ipl::Interrupt, VecDeque::new()),
        }
    }
}

static CORES: [CoreBlock; MAX_CPUS] = {
    const INIT: CoreBlock = CoreBlock::new();
    [INIT; MAX_CPUS]
};

static ONLINE_COUNT: AtomicUsize = AtomicUsize::new(0);

fn core(cpu_id: u32) -> &'static CoreBlock {
    &CORES[cpu_id as usize]
}

/// Brings the BSP's core block online. Called once, early in boot, after the
/// local APIC is initialized.
pub fn init_bsp_core() {
    let cpu_id = hal::my_core_id();
    let apic_id = hal::my_cpu_locals().apic_id;
    core(cpu_id).apic_id.store(apic_id, Ordering::Release);
    core(cpu_id).online.store(true, Ordering::Release);
    ONLINE_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Brings an AP's core block online. Called from `arch::x86_64::smp::ap_main`
/// once that CPU's GS base and local APIC are set up, before it is counted
/// as ready by the AP-startup handshake.
pub fn init_ap_core(cpu_id: usize) {
    let apic_id = hal::my_cpu_locals().apic_id;
    CORES[cpu_id].apic_id.store(apic_id, Ordering::Release);
    CORES[cpu_id].online.store(true, Ordering::Release);
    ONLINE_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Number of CPUs that have completed `init_bsp_core`/`init_ap_core`.
pub fn online_count() -> usize {
    ONLINE_COUNT.load(Ordering::Acquire)
}

/// True if `cpu_id` has come online.
pub fn is_online(cpu_id: u32) -> bool {
    (cpu_id as usize) < MAX_CPUS && core(cpu_id).online.load(Ordering::Acquire)
}

/// Local APIC ID backing logical `cpu_id`, for `hal::hw_send_ipi`.
pub fn apic_id_for(cpu_id: u32) -> u32 {
    core(cpu_id).apic_id.load(Ordering::Acquire)
}

fn online_ids() -> impl Iterator<Item = u32> {
    (0..MAX_CPUS as u32).filter(|&id| is_online(id))
}

/// Queues `(function, arg)` to run on `cpu_id` and kicks it with an IPI.
/// `function` runs at `Ipl::Interrupt` on the target CPU inside the mail
/// vector's handler, so it must be short and non-blocking.
pub fn send_mail(cpu_id: u32, function: fn(usize), arg: usize) {
    if cpu_id == hal::my_core_id() {
        function(arg);
        return;
    }
    core(cpu_id).mail.lock().push_back(Mail::Call(function, arg));
    hal::hw_send_ipi(cpu_id, idt::MAIL_VECTOR);
}

/// Invoked from the mail-vector interrupt handler, already at `Ipl::Interrupt`.
pub fn on_mail_ipi() {
    let cpu_id = hal::my_core_id();
    loop {
        let next = core(cpu_id).mail.lock().pop_front();
        match next {
            Some(Mail::Call(f, arg)) => f(arg),
            None => break,
        }
    }
}

/// Invalidates the TLB range `[base, base+length)` on every other online CPU
/// and locally, blocking until every remote CPU has acknowledged. `length ==
/// 0` means a full TLB flush rather than a ranged one.
pub fn flush_remote_tlbs(base: u64, length: u64) {
    let targets: alloc::vec::Vec<u32> = online_ids().filter(|&id| id != hal::my_core_id()).collect();

    if length == 0 {
        hal::hw_flush_tlb_all();
    } else {
        hal::hw_flush_tlb_one(base);
    }

    if targets.is_empty() {
        return;
    }

    let data = alloc::boxed::Box::leak(alloc::boxed::Box::new(RemoteFlushData {
        base,
        length,
        acks: AtomicU32::new(targets.len() as u32),
    }));

    for &cpu_id in &targets {
        core(cpu_id).shootdowns.lock().push_back(data);
        hal::hw_send_ipi(cpu_id, idt::TLB_SHOOTDOWN_VECTOR);
    }

    while data.acks.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }
    // Safe: every target has acked, so nothing else still holds `data`.
    unsafe {
        drop(alloc::boxed::Box::from_raw(data as *const RemoteFlushData as *mut RemoteFlushData));
    }
}

/// Invoked from the shootdown-vector interrupt handler, already at
/// `Ipl::Interrupt`.
pub fn on_tlb_shootdown_ipi() {
    let cpu_id = hal::my_core_id();
    loop {
        let next = core(cpu_id).shootdowns.lock().pop_front();
        match next {
            Some(data) => {
                if data.length == 0 {
                    hal::hw_flush_tlb_all();
                } else {
                    hal::hw_flush_tlb_one(data.base);
                }
                data.acks.fetch_sub(1, Ordering::AcqRel);
            }
            None => break,
        }
    }
}

/// Broadcasts the cross-CPU halt used on an unrecoverable panic (§7). Never
/// waits for acknowledgement; the panicking CPU is about to stop anyway.
pub fn broadcast_halt() {
    hal::hw_broadcast_ipi(idt::HALT_VECTOR);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_cpus_is_reasonable() {
        assert!(MAX_CPUS >= 1 && MAX_CPUS <= 256);
    }
}

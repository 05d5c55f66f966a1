//! Interrupt Priority Level (IPL) gate.
//!
//! IPL is a per-CPU software integer, totally ordered `Passive < Dpc < Interrupt`.
//! It does not mask hardware interrupts by itself; it gates which software paths
//! may run concurrently on this CPU. Every hardware vector handler in
//! `arch::x86_64::idt` brackets its body in an `IplGuard` raised to
//! `Ipl::Interrupt`, so the DPC drain and pending-reschedule checks in
//! `lower` run as the guard drops on the way back out to the interrupted
//! context, never left pending across the `iret`.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::dpc;
use crate::sched;

/// Software preemption gate, ordered `Passive < Dpc < Interrupt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    Passive = 0,
    Dpc = 1,
    Interrupt = 2,
}

impl Ipl {
    const fn from_u8(v: u8) -> Ipl {
        match v {
            0 => Ipl::Passive,
            1 => Ipl::Dpc,
            _ => Ipl::Interrupt,
        }
    }
}

/// One atomic per CPU; indexed by `hal::my_core_id()`.
const MAX_CPUS: usize = crate::smp::MAX_CPUS;
static CURRENT_IPL: [AtomicU8; MAX_CPUS] = {
    const INIT: AtomicU8 = AtomicU8::new(Ipl::Passive as u8);
    [INIT; MAX_CPUS]
};

fn slot() -> &'static AtomicU8 {
    &CURRENT_IPL[crate::hal::my_core_id() as usize]
}

/// Returns the current CPU's IPL.
pub fn current() -> Ipl {
    Ipl::from_u8(slot().load(Ordering::Acquire))
}

/// Raises the local IPL to `target`, returning the prior value.
///
/// Panics (programmer invariant violation, per design §7) if `target` is below
/// the current IPL — raising must only raise.
pub fn raise(target: Ipl) -> Ipl {
    let prior = current();
    assert!(
        target >= prior,
        "RaiseIpl may only raise: prior={:?} target={:?}",
        prior,
        target
    );
    slot().store(target as u8, Ordering::Release);
    prior
}

/// Lowers the local IPL to `target`, draining the DPC queue and, on reaching
/// `Passive`, invoking the scheduler if a reschedule is pending.
///
/// Panics if `target` is above the current IPL — lowering must only lower.
pub fn lower(target: Ipl) {
    let prior = current();
    assert!(
        target <= prior,
        "LowerIpl may only lower: prior={:?} target={:?}",
        prior,
        target
    );

    if prior == Ipl::Interrupt && target < Ipl::Interrupt {
        // Transiently sit at Dpc to drain before going further down, so a DPC
        // submitted by the ISR we are unwinding from runs before anything
        // below Dpc observes its effects.
        slot().store(Ipl::Dpc as u8, Ordering::Release);
        dpc::drain_local();
    }

    slot().store(target as u8, Ordering::Release);

    if target == Ipl::Passive {
        if dpc::local_queue_nonempty() {
            // A DPC queued while we were transitioning past Dpc above; drain
            // again rather than leave it stranded until the next interrupt.
            raise(Ipl::Dpc);
            dpc::drain_local();
            slot().store(Ipl::Passive as u8, Ordering::Release);
        }
        if sched::reschedule_pending() {
            sched::schedule();
        }
    }
}

/// RAII guard that raises IPL on construction and restores the prior IPL on
/// drop. This is the primitive `Lock<T>` below it builds on; used directly by
/// the interrupt dispatcher to bracket a handler body.
pub struct IplGuard {
    prior: Ipl,
}

impl IplGuard {
    pub fn raise_to(target: Ipl) -> Self {
        IplGuard {
            prior: raise(target),
        }
    }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        lower(self.prior);
    }
}

/// A spinlock annotated with a maximum acquisition IPL (its "ceiling").
///
/// Acquiring raises the local IPL to the ceiling (if not already there or
/// above) and restores it on release, per the §4.1 contract. Acquiring a lock
/// above its ceiling is a debug-only assertion, not a runtime check in
/// release builds, matching the source's treatment of this as a programmer
/// invariant rather than a recoverable condition.
pub struct IplLock<T> {
    ceiling: Ipl,
    inner: spin::Mutex<T>,
}

pub struct IplLockGuard<'a, T> {
    prior: Ipl,
    guard: Option<spin::MutexGuard<'a, T>>,
}

impl<T> IplLock<T> {
    pub const fn new(ceiling: Ipl, value: T) -> Self {
        IplLock {
            ceiling,
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IplLockGuard<'_, T> {
        debug_assert!(
            current() <= self.ceiling,
            "lock acquired above its ceiling"
        );
        let prior = raise(self.ceiling);
        IplLockGuard {
            prior,
            guard: Some(self.inner.lock()),
        }
    }

    /// Non-blocking variant of `lock`, for panic and drain paths that must
    /// never wait on a lock another CPU might be holding.
    pub fn try_lock(&self) -> Option<IplLockGuard<'_, T>> {
        debug_assert!(
            current() <= self.ceiling,
            "lock acquired above its ceiling"
        );
        let guard = self.inner.try_lock()?;
        let prior = raise(self.ceiling);
        Some(IplLockGuard {
            prior,
            guard: Some(guard),
        })
    }
}

impl<'a, T> core::ops::Deref for IplLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> core::ops::DerefMut for IplLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for IplLockGuard<'a, T> {
    fn drop(&mut self) {
        // Release the data lock first, then restore IPL, so no other CPU
        // can observe us below our ceiling while still holding the lock.
        self.guard.take();
        lower(self.prior);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total() {
        assert!(Ipl::Passive < Ipl::Dpc);
        assert!(Ipl::Dpc < Ipl::Interrupt);
        assert!(Ipl::Passive < Ipl::Interrupt);
    }

    #[test]
    #[should_panic(expected = "RaiseIpl may only raise")]
    fn raise_below_current_panics() {
        let _ = raise(Ipl::Interrupt);
        raise(Ipl::Passive);
    }
}

//! Thread records: lifecycle, priority, and the primed machine context a
//! thread starts from before it has ever run.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU8, Ordering};

use crate::arch::x86_64::CpuContext;
use crate::wait::ThreadWaitState;

pub type ThreadId = usize;

const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Real-time priorities occupy the top of the range and are never subject to
/// dynamic adjustment; idle is its own reserved value below the time-share band.
pub const PRIO_IDLE: u8 = 0;
pub const PRIO_TS_MIN: u8 = 1;
pub const PRIO_TS_MAX: u8 = 127;
pub const PRIO_RT_MIN: u8 = 128;
pub const PRIO_RT_MAX: u8 = 255;

/// `niceness` is base-20, matching the source's `[0,39]` range: 20 is neutral,
/// below favors the thread, above penalizes it.
pub const NICENESS_NEUTRAL: u8 = 20;
pub const NICENESS_MAX: u8 = 39;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Dead = 0,
    Standby = 1,
    Ready = 2,
    Executing = 3,
    Waiting = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Dead,
            1 => ThreadState::Standby,
            2 => ThreadState::Ready,
            3 => ThreadState::Executing,
            _ => ThreadState::Waiting,
        }
    }
}

/// Exponential-moving-average run/sleep tracker behind the interactive boost.
/// `numerator`/`denominator` are fixed-point nanosecond accumulators cleared
/// each time the ratio is consulted.
struct RunSleepRatio {
    run_ns: u64,
    sleep_ns: u64,
}

pub struct Thread {
    pub id: ThreadId,
    base_priority: AtomicU8,
    niceness: AtomicU8,
    interactive_boost: AtomicI8,
    state: AtomicU8,
    pub(crate) pinned_cpu: AtomicU32, // u32::MAX means unpinned
    pub(crate) is_pinned: AtomicBool,

    pub(crate) context: UnsafeCell<CpuContext>,
    _stack: Box<[u8]>,

    entry: UnsafeCell<Option<(fn(usize), usize)>>,

    pub(crate) wait_state: ThreadWaitState,
    ratio: spin::Mutex<RunSleepRatio>,

    user_ns: core::sync::atomic::AtomicU64,
    kernel_ns: core::sync::atomic::AtomicU64,
}

// `context`/`_stack`/`entry` are only ever touched by the CPU that currently
// owns the thread (running it or priming it before its first run); hand-off
// between CPUs happens only while the thread is off every run queue and not
// executing, serialized by the run-queue lock.
unsafe impl Sync for Thread {}

impl Thread {
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority.load(Ordering::Relaxed)
    }

    pub fn set_base_priority(&self, p: u8) {
        self.base_priority.store(p, Ordering::Relaxed);
    }

    /// §4.7's pinned-down formula for the time-share band; real-time and idle
    /// threads never recompute and just return their base priority.
    pub fn dynamic_priority(&self) -> u8 {
        let base = self.base_priority();
        if base == PRIO_IDLE || base >= PRIO_RT_MIN {
            return base;
        }
        let niceness = self.niceness.load(Ordering::Relaxed) as i32;
        let boost = self.interactive_boost.load(Ordering::Relaxed) as i32;
        let adjusted = base as i32 + (NICENESS_NEUTRAL as i32 - niceness) / 4 + boost;
        adjusted.clamp(PRIO_TS_MIN as i32, PRIO_TS_MAX as i32) as u8
    }

    pub fn set_niceness(&self, niceness: u8) {
        self.niceness.store(niceness.min(NICENESS_MAX), Ordering::Relaxed);
    }

    /// Folds one quantum's run/sleep split into the EMA (alpha = 1/4) and
    /// recomputes the interactive boost: mostly-sleeping threads get `+2`,
    /// mostly-running (CPU-bound) threads get `-2`, otherwise `0`.
    pub(crate) fn record_quantum(&self, ran_ns: u64, slept_ns: u64) {
        let mut ratio = self.ratio.lock();
        ratio.run_ns = ratio.run_ns - ratio.run_ns / 4 + ran_ns / 4;
        ratio.sleep_ns = ratio.sleep_ns - ratio.sleep_ns / 4 + slept_ns / 4;
        let boost = if ratio.run_ns == 0 {
            2
        } else if ratio.sleep_ns * 3 < ratio.run_ns {
            -2
        } else if ratio.run_ns * 3 < ratio.sleep_ns {
            2
        } else {
            0
        };
        self.interactive_boost.store(boost, Ordering::Relaxed);
    }

    pub fn add_user_ns(&self, ns: u64) {
        self.user_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn add_kernel_ns(&self, ns: u64) {
        self.kernel_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn accounting(&self) -> (u64, u64) {
        (
            self.user_ns.load(Ordering::Relaxed),
            self.kernel_ns.load(Ordering::Relaxed),
        )
    }

    pub fn pin_to(&self, cpu_id: u32) {
        self.pinned_cpu.store(cpu_id, Ordering::Relaxed);
        self.is_pinned.store(true, Ordering::Release);
    }

    pub(crate) fn take_entry(&self) -> Option<(fn(usize), usize)> {
        unsafe { (*self.entry.get()).take() }
    }
}

/// Allocates a kernel stack and primes `ctx` so the thread's first
/// `hal::hw_switch_thread` lands on `entry(arg)`. Corresponds to `PrepareThread`.
pub(crate) fn new_standby(id: ThreadId, priority: u8, entry: fn(usize), arg: usize) -> Thread {
    let stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;
    let ctx = crate::hal::hw_prime_thread(stack_top, thread_trampoline, id);

    Thread {
        id,
        base_priority: AtomicU8::new(priority),
        niceness: AtomicU8::new(NICENESS_NEUTRAL),
        interactive_boost: AtomicI8::new(0),
        state: AtomicU8::new(ThreadState::Standby as u8),
        pinned_cpu: AtomicU32::new(u32::MAX),
        is_pinned: AtomicBool::new(false),
        context: UnsafeCell::new(ctx),
        _stack: stack,
        entry: UnsafeCell::new(Some((entry, arg))),
        wait_state: ThreadWaitState::new(id),
        ratio: spin::Mutex::new(RunSleepRatio { run_ns: 0, sleep_ns: 0 }),
        user_ns: core::sync::atomic::AtomicU64::new(0),
        kernel_ns: core::sync::atomic::AtomicU64::new(0),
    }
}

/// Lands here on a thread's very first `switch_to`; looks itself up by id,
/// runs the real entry point, and retires the thread when it returns.
extern "C" fn thread_trampoline(id: usize) -> ! {
    let (entry, arg) = crate::sched::thread_by_id(id)
        .take_entry()
        .expect("thread trampoline invoked twice");
    entry(arg);
    crate::sched::exit_current_thread();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_priority_clamps_to_band() {
        let t = new_standby(0, PRIO_TS_MIN, |_| {}, 0);
        t.set_niceness(39);
        assert!(t.dynamic_priority() >= PRIO_TS_MIN);
        t.set_niceness(0);
        assert!(t.dynamic_priority() <= PRIO_TS_MAX);
    }

    #[test]
    fn real_time_priority_is_never_adjusted() {
        let t = new_standby(0, 200, |_| {}, 0);
        t.set_niceness(39);
        assert_eq!(t.dynamic_priority(), 200);
    }
}

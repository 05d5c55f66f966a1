//! Waitable synchronization: conditions, timers, and mutexes, with
//! `wait_many` built on ascending-address multi-lock ordering so a thread can
//! block on several waitables at once without ever deadlocking against
//! another thread doing the same over an overlapping set.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::clock::{ClockEvent, ClockEventHandle, TimePoint};
use crate::dpc::Dpc;
use crate::ipl::{Ipl, IplLock};
use crate::sched::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitableType {
    Condition,
    Timer,
    Mutex,
}

/// Monotonically increasing: only the highest status a `WaitEntry` ever
/// reaches is reported back to its caller, per §4's `WaitEntry` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WaitStatus {
    Incomplete = 0,
    Timedout = 1,
    Reset = 2,
    Cancelled = 3,
    Success = 4,
}

impl WaitStatus {
    fn from_u8(v: u8) -> WaitStatus {
        match v {
            0 => WaitStatus::Incomplete,
            1 => WaitStatus::Timedout,
            2 => WaitStatus::Reset,
            3 => WaitStatus::Cancelled,
            _ => WaitStatus::Success,
        }
    }
}

/// One thread's stake in a call to `wait_many`. Heap-allocated and leaked for
/// the duration of the wait rather than borrowed from the caller's stack, so
/// pushing a reference into a waitable's waiter list never needs `unsafe`
/// lifetime extension; reclaimed via `Box::from_raw` once the wait completes.
pub struct WaitEntry {
    waitable: &'static Waitable,
    thread: ThreadId,
    status: AtomicU8,
}

impl WaitEntry {
    fn bump_status(&self, s: WaitStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if s as u8 > cur { Some(s as u8) } else { None }
            });
    }

    fn status(&self) -> WaitStatus {
        WaitStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// Per-thread bookkeeping of which `WaitEntry` records are currently
/// outstanding, so `cancel_wait` can find and retire them without scanning
/// every waitable in the system. `timeout_dpc` is reused across every wait
/// this thread ever makes (a thread waits on at most one thing at a time),
/// avoiding a fresh heap allocation per call.
pub struct ThreadWaitState {
    pending: IplLock<Vec<&'static WaitEntry>>,
    pub(crate) timeout_dpc: Dpc,
}

impl ThreadWaitState {
    pub fn new(thread: ThreadId) -> Self {
        ThreadWaitState {
            pending: IplLock::new(Ipl::Dpc, Vec::new()),
            timeout_dpc: Dpc::new(do_timeout_wait, thread),
        }
    }
}

struct WaitableState {
    /// Condition: 0 or 1. Mutex: 0 (held) or available-count. Timer: mirrors
    /// condition semantics, driven by its clock event firing.
    tickets: u32,
    holder: Option<ThreadId>,
    waiters: VecDeque<&'static WaitEntry>,
    clock_handle: Option<ClockEventHandle>,
}

pub struct Waitable {
    kind: WaitableType,
    state: IplLock<WaitableState>,
}

impl Waitable {
    pub const fn new(kind: WaitableType) -> Self {
        let initial_tickets = match kind {
            WaitableType::Mutex => 1,
            WaitableType::Condition | WaitableType::Timer => 0,
        };
        Waitable {
            kind,
            state: IplLock::new(
                Ipl::Dpc,
                WaitableState {
                    tickets: initial_tickets,
                    holder: None,
                    waiters: VecDeque::new(),
                    clock_handle: None,
                },
            ),
        }
    }

    fn addr(&self) -> usize {
        self as *const _ as usize
    }
}

/// Arms a `Timer` waitable to fire at `expiry`, replacing any previously
/// armed event. The clock subsystem signals it through `signal_from_interrupt`
/// when the event fires.
pub fn arm_timer(w: &'static Waitable, expiry: TimePoint) {
    debug_assert!(w.kind == WaitableType::Timer, "arm_timer on a non-timer waitable");
    let mut st = w.state.lock();
    if let Some(old) = st.clock_handle.take() {
        crate::clock::remove_clock_event(old);
    }
    st.clock_handle = Some(crate::clock::add_clock_event(ClockEvent::for_waitable(expiry, w)));
}

/// Waits on a single waitable; a thin wrapper over `wait_many`.
pub fn wait_one(waitable: &'static Waitable, timeout_ns: Option<u64>) -> WaitStatus {
    wait_many(&[waitable], timeout_ns).0
}

/// Blocks the calling thread until any one of `waitables` is acquired, the
/// timeout expires, or the wait is reset/cancelled. Returns the resulting
/// status and the index of the waitable that was satisfied (meaningful only
/// when the status is `Success`).
pub fn wait_many(waitables: &[&'static Waitable], timeout_ns: Option<u64>) -> (WaitStatus, usize) {
    let thread = sched::current_thread_id();

    loop {
        let entries: Vec<&'static WaitEntry> = waitables
            .iter()
            .map(|&w| {
                &*Box::leak(Box::new(WaitEntry {
                    waitable: w,
                    thread,
                    status: AtomicU8::new(WaitStatus::Incomplete as u8),
                }))
            })
            .collect();

        // Lock every waitable in ascending address order, independent of the
        // order the caller listed them in, so two threads waiting on an
        // overlapping set never deadlock against each other.
        let mut order: Vec<usize> = (0..waitables.len()).collect();
        order.sort_by_key(|&i| waitables[i].addr());

        let mut guards = Vec::with_capacity(order.len());
        for &i in &order {
            guards.push((i, waitables[i].state.lock()));
        }

        let mut satisfied = None;
        for (slot, &i) in order.iter().enumerate() {
            let acquired = {
                let (_, st) = &mut guards[slot];
                if st.tickets > 0 {
                    match waitables[i].kind {
                        WaitableType::Mutex => {
                            st.tickets = 0;
                            st.holder = Some(thread);
                        }
                        WaitableType::Condition | WaitableType::Timer => {}
                    }
                    true
                } else {
                    false
                }
            };
            if acquired {
                entries[i].bump_status(WaitStatus::Success);
                satisfied = Some(i);
                break;
            }
        }

        if let Some(i) = satisfied {
            drop(guards);
            reclaim(entries);
            return (WaitStatus::Success, i);
        }

        if timeout_ns == Some(0) {
            drop(guards);
            reclaim(entries);
            return (WaitStatus::Timedout, 0);
        }

        // Publish our pending entries before dropping the thread's own lock,
        // so `cancel_wait` can find them the instant we're visible as Waiting.
        {
            let mut pending = thread_wait_state().pending.lock();
            pending.clear();
            pending.extend(entries.iter().copied());
        }

        for (slot, &i) in order.iter().enumerate() {
            let (_, st) = &mut guards[slot];
            st.waiters.push_back(entries[i]);
        }
        drop(guards);

        let timeout_handle = timeout_ns.map(|ns| {
            let dpc_ref: &'static Dpc = &thread_wait_state().timeout_dpc;
            let expiry: TimePoint = crate::hal::hw_read_timestamp() + ns;
            crate::clock::add_clock_event(ClockEvent::for_dpc(expiry, dpc_ref))
        });

        sched::block_current_thread();

        if let Some(handle) = timeout_handle {
            crate::clock::remove_clock_event(handle);
        }

        let max_status = entries.iter().map(|e| e.status()).max().unwrap_or(WaitStatus::Incomplete);
        if max_status != WaitStatus::Success {
            reclaim(entries);
            return (max_status, 0);
        }
        // Woken to retry (mutex hand-off avoidance): loop back and re-attempt
        // acquisition rather than assuming ownership transferred.
        reclaim(entries);
    }
}

fn reclaim(entries: Vec<&'static WaitEntry>) {
    thread_wait_state().pending.lock().clear();
    for e in entries {
        unsafe {
            drop(Box::from_raw(e as *const WaitEntry as *mut WaitEntry));
        }
    }
}

fn thread_wait_state() -> &'static ThreadWaitState {
    &sched::current_thread().wait_state
}

fn do_timeout_wait(thread: usize) {
    let pending = sched::thread_by_id(thread).wait_state.pending.lock();
    for entry in pending.iter() {
        entry.bump_status(WaitStatus::Timedout);
    }
    drop(pending);
    sched::wake_thread(thread);
}

/// Signals `w`. A condition wakes every waiter currently queued (broadcast
/// semantics: all of them observe the signal, not just the head of the
/// line). A timer, which only ever has one logical firing per arm, wakes its
/// single waiter the same way a condition would if more than one thread
/// happened to be waiting on it. A mutex hands out one more holder slot and
/// wakes a single waiter, who is responsible for re-attempting acquisition
/// itself rather than being handed ownership directly — this avoids a lock
/// convoy where every waiter is serialized behind the wake order even when a
/// CPU that never slept could have taken the lock first.
pub fn signal_waitable(w: &'static Waitable) {
    let mut st = w.state.lock();
    let to_wake: Vec<&'static WaitEntry> = match w.kind {
        WaitableType::Mutex => {
            st.holder = None;
            st.tickets += 1;
            st.waiters.pop_front().into_iter().collect()
        }
        WaitableType::Condition | WaitableType::Timer => {
            st.tickets = 1;
            st.waiters.drain(..).collect()
        }
    };
    drop(st);
    for entry in to_wake {
        entry.bump_status(WaitStatus::Success);
        sched::wake_thread(entry.thread);
    }
}

/// Clears `w`'s signalled state, if legal for its type: a condition is
/// always resettable, a timer only if its clock event is still pending (and
/// gets cancelled), a mutex only if currently unheld.
pub fn reset_waitable(w: &'static Waitable) -> bool {
    let mut st = w.state.lock();
    match w.kind {
        WaitableType::Condition => {
            st.tickets = 0;
            true
        }
        WaitableType::Timer => {
            if let Some(handle) = st.clock_handle.take() {
                if !crate::clock::remove_clock_event(handle) {
                    return false;
                }
            }
            st.tickets = 0;
            true
        }
        WaitableType::Mutex => {
            if st.holder.is_some() {
                false
            } else {
                true
            }
        }
    }
}

/// Queue of waitables an interrupt handler asked to signal, drained by a DPC.
/// Signalling takes a `Dpc`-ceiling lock internally, which an ISR at
/// `Ipl::Interrupt` may not acquire directly (§4.8's "signal from above
/// IPL=Dpc" rule) — so the ISR only ever appends here and queues the drain.
static PENDING_SIGNALS: IplLock<VecDeque<&'static Waitable>> = IplLock::new(Ipl::Interrupt, VecDeque::new());
static SIGNAL_DRAIN_DPC: Dpc = Dpc::new(drain_pending_signals, 0);

fn drain_pending_signals(_arg: usize) {
    loop {
        let next = PENDING_SIGNALS.lock().pop_front();
        match next {
            Some(w) => signal_waitable(w),
            None => break,
        }
    }
}

/// Signals `w` from interrupt context (e.g. a clock event firing a timer
/// waitable). Defers the actual signal to a DPC rather than acquiring `w`'s
/// lock directly, since that lock's ceiling is `Dpc`, below `Interrupt`.
pub fn signal_from_interrupt(w: &'static Waitable) {
    PENDING_SIGNALS.lock().push_back(w);
    crate::dpc::queue_dpc(&SIGNAL_DRAIN_DPC);
}

/// Cancels every wait `thread` currently has outstanding, waking it with
/// `Cancelled` status.
pub fn cancel_wait(thread: ThreadId) {
    let t = sched::thread_by_id(thread);
    let pending = t.wait_state.pending.lock();
    for entry in pending.iter() {
        entry.bump_status(WaitStatus::Cancelled);
    }
    drop(pending);
    sched::wake_thread(thread);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_ordering_matches_spec() {
        assert!(WaitStatus::Incomplete < WaitStatus::Timedout);
        assert!(WaitStatus::Timedout < WaitStatus::Reset);
        assert!(WaitStatus::Reset < WaitStatus::Cancelled);
        assert!(WaitStatus::Cancelled < WaitStatus::Success);
    }

    #[test]
    fn mutex_starts_available() {
        let m = Waitable::new(WaitableType::Mutex);
        assert_eq!(m.state.lock().tickets, 1);
    }

    #[test]
    fn condition_starts_unsignalled() {
        let c = Waitable::new(WaitableType::Condition);
        assert_eq!(c.state.lock().tickets, 0);
    }
}

//! Per-CPU ordered clock-event list, fired by the HAL's one-shot alarm.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::dpc::Dpc;
use crate::ipl::{Ipl, IplLock};
use crate::smp::MAX_CPUS;
use crate::wait::Waitable;

/// Monotonic nanoseconds since boot.
pub type TimePoint = u64;

/// `{expiry, dpc | waitable}` — exactly one of the two targets is set. The
/// `fired` flag lets `remove_clock_event` distinguish "still queued" from
/// "already popped by the alarm handler", per the race in §8 scenario 5.
pub struct ClockEvent {
    expiry: TimePoint,
    target: Target,
    fired: AtomicBool,
}

enum Target {
    Dpc(&'static Dpc),
    Waitable(&'static Waitable),
}

impl ClockEvent {
    pub fn for_dpc(expiry: TimePoint, dpc: &'static Dpc) -> Self {
        ClockEvent {
            expiry,
            target: Target::Dpc(dpc),
            fired: AtomicBool::new(false),
        }
    }

    pub fn for_waitable(expiry: TimePoint, waitable: &'static Waitable) -> Self {
        ClockEvent {
            expiry,
            target: Target::Waitable(waitable),
            fired: AtomicBool::new(false),
        }
    }

    fn fire(&self) {
        match self.target {
            Target::Dpc(dpc) => crate::dpc::queue_dpc(dpc),
            Target::Waitable(w) => crate::wait::signal_from_interrupt(w),
        }
    }
}

struct PerCpuClock {
    // Ordered ascending by expiry; insertion is O(n) which is acceptable for
    // the small number of concurrently pending timeouts on one CPU.
    events: VecDeque<Box<ClockEvent>>,
}

static CLOCKS: [IplLock<PerCpuClock>; MAX_CPUS] = {
    const INIT: IplLock<PerCpuClock> = IplLock::new(Ipl::Interrupt, PerCpuClock { events: VecDeque::new() });
    [INIT; MAX_CPUS]
};

/// Opaque handle returned by `add_clock_event`, used by `remove_clock_event`.
pub struct ClockEventHandle {
    cpu: usize,
    raw: *const ClockEvent,
}

unsafe impl Send for ClockEventHandle {}

fn local_clock() -> &'static IplLock<PerCpuClock> {
    &CLOCKS[crate::hal::my_core_id() as usize]
}

/// Inserts `event`, re-arming the HAL one-shot alarm if it is now the
/// earliest pending event on this CPU.
pub fn add_clock_event(event: ClockEvent) -> ClockEventHandle {
    let boxed = Box::new(event);
    let raw = boxed.as_ref() as *const ClockEvent;
    let cpu = crate::hal::my_core_id() as usize;

    let mut clk = local_clock().lock();
    let pos = clk
        .events
        .iter()
        .position(|e| e.expiry > boxed.expiry)
        .unwrap_or(clk.events.len());
    let is_earliest = pos == 0;
    clk.events.insert(pos, boxed);
    if is_earliest {
        let expiry = clk.events[0].expiry;
        drop(clk);
        crate::hal::hw_set_alarm(expiry);
    }

    ClockEventHandle { cpu, raw }
}

/// Removes a still-pending event. Returns `false` if it already fired (the
/// alarm handler popped and fired it before this call could reach the lock).
pub fn remove_clock_event(handle: ClockEventHandle) -> bool {
    let mut clk = CLOCKS[handle.cpu].lock();
    if let Some(idx) = clk.events.iter().position(|e| e.as_ref() as *const ClockEvent == handle.raw) {
        let event = clk.events.remove(idx).unwrap();
        event.fired.store(true, Ordering::Release);
        true
    } else {
        false
    }
}

/// Invoked by the HAL's alarm-fired interrupt, already at `Ipl::Interrupt`.
/// Pops and fires every event whose expiry has passed, then re-arms for the
/// next pending event, if any.
pub fn on_alarm_fired(now: TimePoint) {
    let mut fired = alloc::vec::Vec::new();
    {
        let mut clk = local_clock().lock();
        while let Some(front) = clk.events.front() {
            if front.expiry > now {
                break;
            }
            let event = clk.events.pop_front().unwrap();
            event.fired.store(true, Ordering::Release);
            fired.push(event);
        }
        if let Some(next) = clk.events.front() {
            let expiry = next.expiry;
            drop(clk);
            crate::hal::hw_set_alarm(expiry);
        }
    }
    for event in fired {
        event.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_ascending_on_insert() {
        let mut q: VecDeque<u64> = VecDeque::new();
        for e in [50u64, 10, 30, 20] {
            let pos = q.iter().position(|&x| x > e).unwrap_or(q.len());
            q.insert(pos, e);
        }
        assert_eq!(q.into_iter().collect::<alloc::vec::Vec<_>>(), alloc::vec![10, 20, 30, 50]);
    }
}

//! Deferred Procedure Calls: a per-CPU FIFO of short work items run at
//! `Ipl::Dpc`, draining on every lowering past that level (see `ipl::lower`).

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::ipl::{Ipl, IplLock};
use crate::smp::MAX_CPUS;

/// A one-shot, identity-based deferred call. The submitter owns the record
/// until it has run or a `cancel` has definitely prevented that; nothing here
/// copies or clones a queued DPC.
pub struct Dpc {
    function: fn(usize),
    arg: usize,
    queued: AtomicBool,
}

impl Dpc {
    pub const fn new(function: fn(usize), arg: usize) -> Self {
        Dpc {
            function,
            arg,
            queued: AtomicBool::new(false),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

struct Queue {
    items: VecDeque<&'static Dpc>,
}

/// One FIFO per CPU, guarded by an `Ipl::Dpc`-ceiling lock: safe to touch from
/// any IPL at or below `Interrupt` because `queue_dpc` only ever takes the
/// lock after raising to `Dpc` itself.
static QUEUES: [IplLock<Queue>; MAX_CPUS] = {
    const INIT: IplLock<Queue> = IplLock::new(Ipl::Dpc, Queue { items: VecDeque::new() });
    [INIT; MAX_CPUS]
};

fn local_queue() -> &'static IplLock<Queue> {
    &QUEUES[crate::hal::my_core_id() as usize]
}

/// Enqueues `dpc` on the local CPU's queue. Safe from any IPL ≤ `Interrupt`.
///
/// The record referenced by `dpc` must outlive its execution; callers
/// typically embed a `Dpc` in a longer-lived structure (a waitable's timeout
/// record, a clock event, an I/O completion) rather than on the stack.
pub fn queue_dpc(dpc: &'static Dpc) {
    if dpc.queued.swap(true, Ordering::AcqRel) {
        // Already queued; a DPC is not re-entered while pending.
        return;
    }
    {
        let mut q = local_queue().lock();
        q.items.push_back(dpc);
    }
    // If the caller is below Dpc, lower() always checks local_queue_nonempty()
    // before returning to Passive, and the interrupt path always transits Dpc
    // on its way down, so no extra bookkeeping is needed beyond having queued it.
}

/// True if the local CPU's DPC queue has pending work.
pub fn local_queue_nonempty() -> bool {
    !local_queue().lock().items.is_empty()
}

/// Runs every DPC currently queued on the local CPU, one at a time, at
/// `Ipl::Dpc`, checking for new arrivals between each (P7: a DPC runs to
/// completion without the local scheduler interrupting — there is no
/// scheduler entry point reachable from `Ipl::Dpc`).
pub fn drain_local() {
    loop {
        let next = {
            let mut q = local_queue().lock();
            q.items.pop_front()
        };
        match next {
            Some(dpc) => {
                // Clear before running: a handler may legitimately re-submit
                // itself (e.g. a periodic DPC), and that must be observable
                // as a fresh queueing rather than a no-op.
                dpc.queued.store(false, Ordering::Release);
                (dpc.function)(dpc.arg);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    static HITS: AtomicU32 = AtomicU32::new(0);

    fn bump(_arg: usize) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    static D1: Dpc = Dpc::new(bump, 0);

    #[test]
    fn queue_then_drain_runs_once() {
        HITS.store(0, Ordering::SeqCst);
        queue_dpc(&D1);
        assert!(D1.is_queued());
        drain_local();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert!(local_queue_nonempty() == false);
    }

    #[test]
    fn requeue_while_queued_is_a_no_op() {
        HITS.store(0, Ordering::SeqCst);
        queue_dpc(&D1);
        queue_dpc(&D1); // already queued, ignored
        drain_local();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }
}

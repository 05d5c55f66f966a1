//! Per-CPU priority-indexed run queue.
//!
//! 256 FIFOs, one per priority level, with a bitmap alongside them so the
//! highest non-empty level is found in a handful of instructions rather than
//! a linear scan — the same trick classic O(1) schedulers use.

use alloc::collections::VecDeque;

use crate::ipl::{Ipl, IplLock};
use crate::sched::thread::ThreadId;

const LEVELS: usize = 256;
const WORDS: usize = LEVELS / 64;

struct Levels {
    queues: [VecDeque<ThreadId>; LEVELS],
    bitmap: [u64; WORDS],
}

impl Levels {
    fn new() -> Self {
        Levels {
            queues: core::array::from_fn(|_| VecDeque::new()),
            bitmap: [0u64; WORDS],
        }
    }

    fn mark(&mut self, prio: u8) {
        self.bitmap[prio as usize / 64] |= 1u64 << (prio as usize % 64);
    }

    fn clear_if_empty(&mut self, prio: u8) {
        if self.queues[prio as usize].is_empty() {
            self.bitmap[prio as usize / 64] &= !(1u64 << (prio as usize % 64));
        }
    }

    fn highest(&self) -> Option<u8> {
        for word in (0..WORDS).rev() {
            if self.bitmap[word] != 0 {
                let bit = 63 - self.bitmap[word].leading_zeros();
                return Some((word * 64 + bit as usize) as u8);
            }
        }
        None
    }
}

pub struct RunQueue {
    levels: IplLock<Levels>,
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue {
            levels: IplLock::new(Ipl::Dpc, Levels::new()),
        }
    }

    pub fn push(&self, priority: u8, id: ThreadId) {
        let mut l = self.levels.lock();
        l.queues[priority as usize].push_back(id);
        l.mark(priority);
    }

    /// Pops the head of the highest non-empty level.
    pub fn pop_highest(&self) -> Option<ThreadId> {
        let mut l = self.levels.lock();
        let prio = l.highest()?;
        let id = l.queues[prio as usize].pop_front();
        l.clear_if_empty(prio);
        id
    }

    /// Highest runnable priority currently queued, for the reschedule-IPI
    /// decision in `enqueue_thread` and the load metric used to pick a target
    /// CPU.
    pub fn highest_priority(&self) -> Option<u8> {
        self.levels.lock().highest()
    }

    /// Sum of dynamic priorities of every Ready thread on this queue — the
    /// load metric `enqueue_thread` uses to pick the least-loaded CPU.
    pub fn load(&self) -> u64 {
        let l = self.levels.lock();
        let mut total = 0u64;
        for prio in 0..LEVELS {
            total += l.queues[prio].len() as u64 * prio as u64;
        }
        total
    }

    /// Removes a specific thread id from wherever in the queue it sits, for
    /// `cancel_wait`/affinity changes. O(queue length); rare path.
    pub fn remove(&self, priority: u8, id: ThreadId) -> bool {
        let mut l = self.levels.lock();
        let q = &mut l.queues[priority as usize];
        if let Some(pos) = q.iter().position(|&x| x == id) {
            q.remove(pos);
            l.clear_if_empty(priority);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_highest_priority_first() {
        let rq = RunQueue::new();
        rq.push(10, 1);
        rq.push(200, 2);
        rq.push(50, 3);
        assert_eq!(rq.pop_highest(), Some(2));
        assert_eq!(rq.pop_highest(), Some(3));
        assert_eq!(rq.pop_highest(), Some(1));
        assert_eq!(rq.pop_highest(), None);
    }

    #[test]
    fn fifo_within_a_level() {
        let rq = RunQueue::new();
        rq.push(5, 1);
        rq.push(5, 2);
        assert_eq!(rq.pop_highest(), Some(1));
        assert_eq!(rq.pop_highest(), Some(2));
    }
}

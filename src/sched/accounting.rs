//! Per-CPU cycle accounting: attributes elapsed time to the tag that was
//! active since the last transition, charged against the thread that was
//! current at the time.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::smp::MAX_CPUS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CycleAccountTag {
    User = 0,
    Kernel = 1,
    KernelInterrupt = 2,
    Driver = 3,
    DriverInterrupt = 4,
    Debugger = 5,
}

impl CycleAccountTag {
    fn from_u8(v: u8) -> CycleAccountTag {
        match v {
            0 => CycleAccountTag::User,
            1 => CycleAccountTag::Kernel,
            2 => CycleAccountTag::KernelInterrupt,
            3 => CycleAccountTag::Driver,
            4 => CycleAccountTag::DriverInterrupt,
            _ => CycleAccountTag::Debugger,
        }
    }
}

struct PerCpuAccount {
    tag: AtomicU8,
    since_ns: AtomicU64,
}

static ACCOUNTS: [PerCpuAccount; MAX_CPUS] = {
    const INIT: PerCpuAccount = PerCpuAccount {
        tag: AtomicU8::new(CycleAccountTag::Kernel as u8),
        since_ns: AtomicU64::new(0),
    };
    [INIT; MAX_CPUS]
};

fn local() -> &'static PerCpuAccount {
    &ACCOUNTS[crate::hal::my_core_id() as usize]
}

/// Transitions the local CPU's cycle tag, folding the elapsed time since the
/// last transition into `charge_to`'s user/kernel bucket per the previous tag.
pub fn transition(new_tag: CycleAccountTag, charge_to: &super::thread::Thread) {
    let now = crate::hal::hw_read_timestamp();
    let acct = local();
    let prior_tag = CycleAccountTag::from_u8(acct.tag.load(Ordering::Relaxed));
    let since = acct.since_ns.swap(now, Ordering::Relaxed);
    let elapsed = now.saturating_sub(since);

    match prior_tag {
        CycleAccountTag::User => charge_to.add_user_ns(elapsed),
        _ => charge_to.add_kernel_ns(elapsed),
    }

    acct.tag.store(new_tag as u8, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips() {
        assert_eq!(CycleAccountTag::from_u8(CycleAccountTag::Driver as u8), CycleAccountTag::Driver);
    }
}

//! The actual machine code behind `CpuContext`/`switch_to`. Isolated here so
//! every other module in the tree only ever sees the opaque `CpuContext`
//! struct and the `switch_to`/`prime_kernel_context` functions; nothing above
//! the HAL writes a register name.
//!
//! `switch_to` saves/restores only the System V callee-saved GPRs, `rsp`,
//! `rip` and `rflags`. `fs_base`/`gs_base` are deliberately left untouched:
//! `gs_base` anchors the *physical CPU's* `CpuLocal` (see `percpu.rs`) and
//! must never change across a switch between two threads on the same CPU;
//! `fs_base` is user-TLS plumbing that belongs to `HwEnterUserContext`, not
//! to the kernel-to-kernel switch path.

use core::arch::global_asm;

use super::CpuContext;

global_asm!(
    ".global npk_switch_to",
    "npk_switch_to:",
    "mov [rdi + 0x00], rbx",
    "mov [rdi + 0x08], rbp",
    "mov [rdi + 0x10], r12",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r14",
    "mov [rdi + 0x28], r15",
    "mov [rdi + 0x30], rsp",
    "lea rax, [rip + 1f]",
    "mov [rdi + 0x38], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 0x40], rax",
    "mov rbx, [rsi + 0x00]",
    "mov rbp, [rsi + 0x08]",
    "mov r12, [rsi + 0x10]",
    "mov r13, [rsi + 0x18]",
    "mov r14, [rsi + 0x20]",
    "mov r15, [rsi + 0x28]",
    "mov rax, [rsi + 0x40]",
    "push rax",
    "popfq",
    "mov rsp, [rsi + 0x30]",
    "jmp qword ptr [rsi + 0x38]",
    "1:",
    "ret",
);

extern "C" {
    fn npk_switch_to(prev: *mut CpuContext, next: *const CpuContext);
}

/// Saves the running thread's machine state into `*prev` and resumes the
/// machine state in `*next`. Returns when some other CPU switches back into
/// `*prev` (or, for the very first switch into a thread, never returns here
/// at all — control resumes at the entry trampoline baked into `*next` by
/// `prime_kernel_context`).
///
/// # Safety
/// `prev` and `next` must be valid, non-overlapping `CpuContext` pointers,
/// and `next` must have been produced either by a prior `switch_to` call that
/// saved into it, or by `prime_kernel_context`. Must be called at `Ipl::Dpc`
/// or above with interrupts and the run-queue lock already released by the
/// caller, per the scheduler's context-switch contract.
pub unsafe fn switch_to(prev: *mut CpuContext, next: *const CpuContext) {
    npk_switch_to(prev, next);
}

/// Builds the initial `CpuContext` for a thread that has never run: `rsp` is
/// seeded to point just past a small trampoline frame so that the first
/// `switch_to` into this context lands in `entry(arg)` rather than at some
/// garbage return address.
pub fn prime_kernel_context(stack_top: u64, entry: extern "C" fn(usize) -> !, arg: usize) -> CpuContext {
    let mut ctx = CpuContext::new();
    ctx.rsp = stack_top;
    ctx.rip = trampoline as u64;
    ctx.rflags = 0x202; // IF=1, reserved bit 1
    ctx.rbx = entry as u64;
    ctx.rbp = arg as u64;
    ctx
}

/// Lands here on a thread's very first `switch_to`: `rbx`/`rbp` carry the
/// real entry point and argument across the restore since `rdi`/`rsi` are
/// not part of `CpuContext`.
extern "C" fn trampoline() -> ! {
    unsafe {
        core::arch::asm!(
            "mov rdi, rbp",
            "call rbx",
            options(noreturn),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_context_has_nonzero_entry() {
        let ctx = prime_kernel_context(0x1000, trampoline, 0);
        assert_eq!(ctx.rip, trampoline as u64);
        assert_eq!(ctx.rsp, 0x1000);
    }
}

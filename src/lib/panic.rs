//! Enhanced panic handler: recursive-panic short-circuit, cross-CPU halt,
//! register dump, heap/build-info snapshot, and a best-effort frame-pointer
//! stack walk.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Global panic state - prevents recursive panics
static PANICKING: AtomicBool = AtomicBool::new(false);

/// Panic counter for tracking multiple panics
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn panic_handler(info: &PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        unsafe {
            crate::uart_print(b"\n!!! RECURSIVE PANIC !!!\n");
        }
        halt();
    }

    let panic_num = PANIC_COUNT.fetch_add(1, Ordering::SeqCst) + 1;

    unsafe {
        core::arch::asm!("cli");
    }
    crate::smp::broadcast_halt();

    print_panic_header(panic_num);
    print_panic_info(info);
    print_registers();
    print_system_state();
    print_recent_logs();
    print_stack_trace();

    halt();
}

fn print_panic_header(panic_num: u64) {
    unsafe {
        crate::uart_print(b"\n");
        crate::uart_print(b"================================================================================\n");
        crate::uart_print(b"!!!                        KERNEL PANIC                                      !!!\n");
        crate::uart_print(b"================================================================================\n");

        if panic_num > 1 {
            let msg = alloc::format!("Panic #{}\n", panic_num);
            crate::uart_print(msg.as_bytes());
        }
        crate::uart_print(b"\n");
    }
}

fn print_panic_info(info: &PanicInfo) {
    unsafe {
        crate::uart_print(b"PANIC INFORMATION:\n");
        crate::uart_print(b"------------------\n");

        if let Some(location) = info.location() {
            let loc = alloc::format!("  Location: {}:{}:{}\n", location.file(), location.line(), location.column());
            crate::uart_print(loc.as_bytes());
        } else {
            crate::uart_print(b"  Location: <unknown>\n");
        }

        if let Some(payload) = info.payload().downcast_ref::<&str>() {
            let msg = alloc::format!("  Message:  {}\n", payload);
            crate::uart_print(msg.as_bytes());
        } else if let Some(payload) = info.payload().downcast_ref::<alloc::string::String>() {
            let msg = alloc::format!("  Message:  {}\n", payload);
            crate::uart_print(msg.as_bytes());
        } else {
            crate::uart_print(b"  Message:  <no message>\n");
        }

        crate::uart_print(b"\n");
    }
}

fn print_registers() {
    use core::arch::asm;
    unsafe {
        crate::uart_print(b"REGISTER DUMP:\n");
        crate::uart_print(b"--------------\n");

        let mut rax: u64; let mut rbx: u64; let mut rcx: u64; let mut rdx: u64;
        let mut rsi: u64; let mut rdi: u64; let mut rbp: u64; let mut rsp: u64;
        let mut r8: u64; let mut r9: u64; let mut r10: u64; let mut r11: u64;
        let mut r12: u64; let mut r13: u64; let mut r14: u64; let mut r15: u64;
        let mut rip: u64;

        asm!("mov {}, rax", out(reg) rax);
        asm!("mov {}, rbx", out(reg) rbx);
        asm!("mov {}, rcx", out(reg) rcx);
        asm!("mov {}, rdx", out(reg) rdx);
        asm!("mov {}, rsi", out(reg) rsi);
        asm!("mov {}, rdi", out(reg) rdi);
        asm!("mov {}, rbp", out(reg) rbp);
        asm!("mov {}, rsp", out(reg) rsp);
        asm!("mov {}, r8", out(reg) r8);
        asm!("mov {}, r9", out(reg) r9);
        asm!("mov {}, r10", out(reg) r10);
        asm!("mov {}, r11", out(reg) r11);
        asm!("mov {}, r12", out(reg) r12);
        asm!("mov {}, r13", out(reg) r13);
        asm!("mov {}, r14", out(reg) r14);
        asm!("mov {}, r15", out(reg) r15);
        asm!("lea {}, [rip]", out(reg) rip);

        let regs = alloc::format!(
            "  rax: {:016x}  rbx: {:016x}  rcx: {:016x}  rdx: {:016x}\n\
             rsi: {:016x}  rdi: {:016x}  rbp: {:016x}  rsp: {:016x}\n\
             r8:  {:016x}  r9:  {:016x}  r10: {:016x}  r11: {:016x}\n\
             r12: {:016x}  r13: {:016x}  r14: {:016x}  r15: {:016x}\n\
             rip: {:016x}\n",
            rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp,
            r8, r9, r10, r11, r12, r13, r14, r15, rip
        );
        crate::uart_print(regs.as_bytes());
        crate::uart_print(b"\n");
    }
}

fn print_system_state() {
    unsafe {
        crate::uart_print(b"SYSTEM STATE:\n");
        crate::uart_print(b"-------------\n");

        let uptime_ns = crate::hal::hw_read_timestamp();
        let msg = alloc::format!("  Uptime:       {} ms\n", uptime_ns / 1_000_000);
        crate::uart_print(msg.as_bytes());

        let stats = crate::heap::get_heap_stats();
        let current_mb = stats.current_allocated() / (1024 * 1024);
        let peak_mb = stats.peak_allocated() / (1024 * 1024);
        let allocs = stats.total_allocations();
        let deallocs = stats.total_deallocations();
        let msg = alloc::format!(
            "  Heap usage:   {} MB current, {} MB peak\n  Allocations:  {} allocs, {} deallocs, {} failures\n",
            current_mb, peak_mb, allocs, deallocs, stats.allocation_failures()
        );
        crate::uart_print(msg.as_bytes());

        let msg = alloc::format!("  Version:      {}\n", crate::build_info::get_version_string());
        crate::uart_print(msg.as_bytes());

        crate::uart_print(b"\n");
    }
}

fn print_recent_logs() {
    unsafe {
        crate::uart_print(b"RECENT LOGS:\n");
        crate::uart_print(b"------------\n");
        let entries = crate::lib::printk::drain_for_panic(16);
        if entries.is_empty() {
            crate::uart_print(b"  [none queued]\n");
        }
        for entry in &entries {
            let line = alloc::format!("  [{:>5}] {}\n", entry.level.as_str(), entry.message());
            crate::uart_print(line.as_bytes());
        }
        crate::uart_print(b"\n");
    }
}

fn print_stack_trace() {
    use core::arch::asm;
    unsafe {
        crate::uart_print(b"STACK TRACE:\n");
        crate::uart_print(b"------------\n");
        crate::uart_print(b"  [requires RUSTFLAGS=\"-C force-frame-pointers=yes\"]\n");

        let mut rbp: u64;
        asm!("mov {}, rbp", out(reg) rbp);

        for i in 0..16 {
            if rbp < 0x1000 || rbp > 0x0000_8000_0000_0000 {
                break;
            }
            let frame_ptr = rbp as *const u64;
            let ret_addr = frame_ptr.offset(1).read_volatile();
            let msg = alloc::format!("  #{}: {:016x}\n", i, ret_addr);
            crate::uart_print(msg.as_bytes());
            rbp = frame_ptr.read_volatile();
        }

        crate::uart_print(b"\n");
    }
}

fn halt() -> ! {
    unsafe {
        crate::uart_print(b"================================================================================\n");
        crate::uart_print(b"System halted.\n");
        crate::uart_print(b"================================================================================\n");
    }
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt");
        }
    }
}

pub fn get_panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

pub fn is_panicking() -> bool {
    PANICKING.load(Ordering::Relaxed)
}

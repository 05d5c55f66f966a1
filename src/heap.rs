//! Kernel heap allocator.
//!
//! Backed by `linked_list_allocator` over a single static, cache-aligned
//! region sized at `HEAP_SIZE`. Wrapped by `StatsTrackingAllocator` so every
//! allocation/deallocation updates the counters `lib::panic` and
//! `print_heap_stats` read back out.

use core::alloc::{GlobalAlloc, Layout};
use linked_list_allocator::LockedHeap;
use spin::Mutex;
use core::sync::atomic::{AtomicBool, Ordering};

/// Cache-aligned array wrapper for heap memory
#[repr(align(64))]
struct CacheAlignedArray([u8; HEAP_SIZE]);

/// Global heap allocator instance (wrapped by guarded allocator below)
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Deterministic no-alloc guard (when true, allocations are rejected)
static DET_NO_ALLOC: AtomicBool = AtomicBool::new(false);

/// Heap statistics for monitoring and debugging
pub struct HeapStats {
    total_allocations: usize,
    total_deallocations: usize,
    current_allocated: usize,
    peak_allocated: usize,
    allocation_failures: usize,
}

impl HeapStats {
    pub fn total_allocations(&self) -> usize { self.total_allocations }
    pub fn total_deallocations(&self) -> usize { self.total_deallocations }
    pub fn current_allocated(&self) -> usize { self.current_allocated }
    pub fn peak_allocated(&self) -> usize { self.peak_allocated }
    pub fn allocation_failures(&self) -> usize { self.allocation_failures }
}

static HEAP_STATS: Mutex<HeapStats> = Mutex::new(HeapStats {
    total_allocations: 0,
    total_deallocations: 0,
    current_allocated: 0,
    peak_allocated: 0,
    allocation_failures: 0,
});

/// Heap configuration
const HEAP_START: usize = 0x444_44440_0000;
const HEAP_SIZE: usize = 8 * 1024 * 1024; // 8 MiB heap for bringup

/// Return total heap size for telemetry calculations
pub const fn heap_total_size() -> usize {
    HEAP_SIZE
}

/// Heap initialization status (lock-free, avoids potential early boot stalls)
static HEAP_INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Initialize the kernel heap
pub fn init_heap() -> Result<(), &'static str> {
    if !HEAP_INIT_DONE.load(Ordering::SeqCst) {
        if HEAP_INIT_DONE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            unsafe {
                static mut HEAP_MEMORY: CacheAlignedArray = CacheAlignedArray([0; HEAP_SIZE]);
                let heap_arr_ptr = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut CacheAlignedArray;
                let heap_start = core::ptr::addr_of_mut!((*heap_arr_ptr).0) as *mut u8;

                ALLOCATOR.lock().init(heap_start, HEAP_SIZE);

                crate::uart_print(b"[HEAP] Initialized ");
                print_size(HEAP_SIZE);
                crate::uart_print(b" heap at 0x");
                print_hex(heap_start as usize);
                crate::uart_print(b"\n");
            }
        }
    }

    Ok(())
}

/// Custom wrapper around GlobalAlloc to track statistics
pub struct StatsTrackingAllocator;

unsafe impl GlobalAlloc for StatsTrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if DET_NO_ALLOC.load(Ordering::Relaxed) {
            return core::ptr::null_mut();
        }

        let ptr = ALLOCATOR.alloc(layout);

        if !ptr.is_null() {
            let mut stats = HEAP_STATS.lock();
            stats.total_allocations += 1;
            stats.current_allocated += layout.size();
            if stats.current_allocated > stats.peak_allocated {
                stats.peak_allocated = stats.current_allocated;
            }
        } else {
            let mut stats = HEAP_STATS.lock();
            stats.allocation_failures += 1;
        }

        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut stats = HEAP_STATS.lock();
        stats.total_deallocations += 1;
        stats.current_allocated = stats.current_allocated.saturating_sub(layout.size());
        drop(stats);

        ALLOCATOR.dealloc(ptr, layout);
    }
}

/// Install guarded global allocator
#[global_allocator]
static GLOBAL_ALLOC: StatsTrackingAllocator = StatsTrackingAllocator;

/// Allocation error handler
#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    unsafe {
        crate::uart_print(b"[HEAP] ALLOCATION ERROR: size=");
        print_size(layout.size());
        crate::uart_print(b" align=");
        print_size(layout.align());
        crate::uart_print(b"\n");

        print_heap_stats();

        loop {}
    }
}

/// Print current heap statistics
pub fn print_heap_stats() {
    let stats = HEAP_STATS.lock();

    unsafe {
        crate::uart_print(b"[HEAP] Stats: allocs=");
        print_number(stats.total_allocations);
        crate::uart_print(b" deallocs=");
        print_number(stats.total_deallocations);
        crate::uart_print(b" current=");
        print_size(stats.current_allocated);
        crate::uart_print(b" peak=");
        print_size(stats.peak_allocated);
        crate::uart_print(b" failures=");
        print_number(stats.allocation_failures);
        crate::uart_print(b"\n");
    }
}

/// Get current heap usage statistics
pub fn get_heap_stats() -> HeapStats {
    let stats = HEAP_STATS.lock();
    HeapStats {
        total_allocations: stats.total_allocations,
        total_deallocations: stats.total_deallocations,
        current_allocated: stats.current_allocated,
        peak_allocated: stats.peak_allocated,
        allocation_failures: stats.allocation_failures,
    }
}

/// Reset current_allocated counter for testing
pub fn reset_current_allocated_for_test() {
    let mut stats = HEAP_STATS.lock();
    stats.current_allocated = 0;
    stats.peak_allocated = 0;
}

/// Exercise the allocator with a few allocation patterns; used by the
/// integration test harness, not invoked during normal boot.
pub fn test_heap() -> Result<(), &'static str> {
    unsafe {
        crate::uart_print(b"[HEAP] Starting heap tests...\n");
    }

    unsafe {
        let layout = Layout::from_size_align(1024, 8).unwrap();
        let ptr = ALLOCATOR.alloc(layout);
        if ptr.is_null() {
            return Err("Failed to allocate 1KB");
        }

        for i in 0..1024 {
            *ptr.add(i) = (i % 256) as u8;
        }

        for i in 0..1024 {
            if *ptr.add(i) != (i % 256) as u8 {
                ALLOCATOR.dealloc(ptr, layout);
                return Err("Memory corruption detected");
            }
        }

        ALLOCATOR.dealloc(ptr, layout);
        crate::uart_print(b"[HEAP] Test 1 passed: basic allocation/deallocation\n");
    }

    let mut ptrs = heapless::Vec::<(*mut u8, Layout), 10>::new();

    unsafe {
        for i in 0..5 {
            let size = 64 * (i + 1);
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = ALLOCATOR.alloc(layout);

            if ptr.is_null() {
                for (ptr, layout) in ptrs.iter() {
                    ALLOCATOR.dealloc(*ptr, *layout);
                }
                return Err("Failed multiple allocation test");
            }

            ptrs.push((ptr, layout)).map_err(|_| "Vec full")?;
        }

        for (ptr, layout) in ptrs.iter() {
            ALLOCATOR.dealloc(*ptr, *layout);
        }

        crate::uart_print(b"[HEAP] Test 2 passed: multiple allocations\n");
    }

    unsafe {
        for align in [8, 16, 32, 64].iter() {
            let layout = Layout::from_size_align(128, *align).unwrap();
            let ptr = ALLOCATOR.alloc(layout);

            if ptr.is_null() {
                return Err("Failed alignment test");
            }

            if (ptr as usize) % align != 0 {
                ALLOCATOR.dealloc(ptr, layout);
                return Err("Alignment requirement not met");
            }

            ALLOCATOR.dealloc(ptr, layout);
        }

        crate::uart_print(b"[HEAP] Test 3 passed: alignment requirements\n");
    }

    unsafe {
        crate::uart_print(b"[HEAP] All tests passed!\n");
    }
    print_heap_stats();
    Ok(())
}

/// Enter deterministic no-alloc region
pub fn det_no_alloc_enter() {
    DET_NO_ALLOC.store(true, Ordering::Relaxed);
}

/// Exit deterministic no-alloc region
pub fn det_no_alloc_exit() {
    DET_NO_ALLOC.store(false, Ordering::Relaxed);
}

/// Helper function to print hex numbers
unsafe fn print_hex(mut num: usize) {
    crate::uart_print(b"0x");
    if num == 0 {
        crate::uart_print(b"0");
        return;
    }

    let mut digits = [0u8; 16];
    let mut i = 0;

    while num > 0 {
        let digit = num % 16;
        digits[i] = if digit < 10 {
            b'0' + digit as u8
        } else {
            b'A' + (digit - 10) as u8
        };
        num /= 16;
        i += 1;
    }

    while i > 0 {
        i -= 1;
        crate::uart_print(&[digits[i]]);
    }
}

/// Helper function to print numbers
unsafe fn print_number(mut num: usize) {
    if num == 0 {
        crate::uart_print(b"0");
        return;
    }

    let mut digits = [0u8; 20];
    let mut i = 0;

    while num > 0 {
        digits[i] = b'0' + (num % 10) as u8;
        num /= 10;
        i += 1;
    }

    while i > 0 {
        i -= 1;
        crate::uart_print(&[digits[i]]);
    }
}

/// Helper function to print sizes with units
unsafe fn print_size(size: usize) {
    if size >= 1024 * 1024 {
        print_number(size / (1024 * 1024));
        crate::uart_print(b" MiB");
    } else if size >= 1024 {
        print_number(size / 1024);
        crate::uart_print(b" KiB");
    } else {
        print_number(size);
        crate::uart_print(b" bytes");
    }
}

/// Bounds check for heap allocations against the static backing region
pub fn is_valid_heap_ptr(ptr: *const u8, size: usize) -> bool {
    let addr = ptr as usize;
    addr >= HEAP_START && addr.saturating_add(size) <= HEAP_START + HEAP_SIZE
}

//! Allocation counting
//!
//! A global allocator wrapper that counts allocations process-wide. Install
//! it in the benchmark binary to get `B/op` and `allocs/op` figures:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: benchkit::alloc::CountingAllocator = benchkit::alloc::CountingAllocator;
//! ```
//!
//! Without it every counter stays at zero.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Global allocator that forwards to the system allocator and counts
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingAllocator;

// SAFETY: every call is forwarded unchanged to `System`; counting only touches atomics.
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record(new_size);
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[inline]
fn record(bytes: usize) {
    // Relaxed is enough: readers only need eventually consistent totals.
    ACTIVE.store(true, Ordering::Relaxed);
    ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    ALLOCATED_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

/// Process-wide allocation totals at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Number of allocations
    pub count: u64,
    /// Number of bytes allocated
    pub bytes: u64,
}

impl AllocStats {
    /// Allocations made between `earlier` and `self`
    pub fn since(&self, earlier: &AllocStats) -> AllocStats {
        AllocStats {
            count: self.count.saturating_sub(earlier.count),
            bytes: self.bytes.saturating_sub(earlier.bytes),
        }
    }
}

/// Current totals
pub fn snapshot() -> AllocStats {
    AllocStats {
        count: ALLOCATIONS.load(Ordering::Relaxed),
        bytes: ALLOCATED_BYTES.load(Ordering::Relaxed),
    }
}

/// Whether a `CountingAllocator` has observed any allocation in this process
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Relaxed)
}

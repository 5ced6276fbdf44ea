//! Pooled allocator for the component-model `cabi_realloc` /
//! `cabi_free` calling convention.
//!
//! Every payload handed out is preceded by a private 8-byte header. Requests
//! that fit a power-of-two size class are served from a per-class CAS-based
//! free list; oversized or over-aligned requests take a fallback path whose
//! spans are parked and reused after a free. Zero-size requests share one
//! static sentinel address unless they ask for more than page alignment.
//!
//! ```
//! use cabi_pool::PoolAllocator;
//!
//! let pool = PoolAllocator::new().unwrap();
//! let p = pool.alloc(100, 8);
//! // Safety: `p` is a live 100-byte block from `pool`.
//! let q = unsafe { pool.realloc(p.as_ptr(), 100, 8, 120) };
//! assert_eq!(p, q); // still fits its 128-byte class
//! unsafe { pool.free(q.as_ptr()) };
//! ```

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
pub mod memory;

// allocator
pub use memory::facade::{
    GlobalPoolAllocator, PoolAllocator, PoolAllocatorConfig, ZERO_SENTINEL_ALIGN, zero_sentinel,
};
pub use memory::handoff::HostBuffer;
pub use memory::header::{BASE_ALIGN, BlockState, HEADER_SIZE};
pub use memory::size_class::{ClassIndex, MAX_CLASSES, SizeClasses};
pub use memory::source::{DEFAULT_REGION_SIZE, RegionSource, SOURCE_ALIGN, SystemSource};

// stats
pub use memory::stats::AllocatorStats;

// errors
pub use memory::source::AllocError;

/// Canonical-ABI reallocation entry point, backed by [`GlobalPoolAllocator`].
///
/// Never returns null; aborts the process if memory cannot be obtained.
///
/// # Safety
///
/// `ptr` must be null, the zero sentinel, or a live pointer previously
/// returned by this function, valid for `old_size` bytes. `align` must be a
/// power of two.
#[cfg(feature = "cabi-exports")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cabi_realloc(
    ptr: *mut u8,
    old_size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    // Safety: upheld by caller.
    unsafe { GlobalPoolAllocator::get().realloc(ptr, old_size, align, new_size) }.as_ptr()
}

/// Canonical-ABI free entry point. Null, the zero sentinel, and repeated
/// frees are ignored.
///
/// # Safety
///
/// `ptr` must be null, the zero sentinel, or a pointer previously returned by
/// [`cabi_realloc`].
#[cfg(feature = "cabi-exports")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cabi_free(ptr: *mut u8) {
    // Safety: upheld by caller.
    unsafe { GlobalPoolAllocator::get().free(ptr) }
}

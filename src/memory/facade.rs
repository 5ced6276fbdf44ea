//! The realloc/free contract.
//!
//! ```text
//!   realloc(ptr, old_size, align, new_size)
//!     ptr null / sentinel ──► first allocation ──┬─► new_size == 0 ──► sentinel
//!                                                ├─► class hit ──► pop | carve block
//!                                                └─► no class ───► fallback
//!     new_size == 0 ────────► free(ptr), sentinel (fallback if align > 4096)
//!     fits in place ────────► ptr
//!     otherwise ────────────► allocate, copy min(old, new), free(ptr)
//! ```
//!
//! Free-list heads and header state tags only ever change through
//! compare-and-swap; no path takes a lock. A `pop` briefly reserves its
//! list's head, see [`FreeList`] for what that means for progress.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::fallback::FallbackCache;
use super::free_list::FreeList;
use super::header::{BASE_ALIGN, BlockHeader, BlockState};
use super::size_class::{ClassIndex, MAX_CLASSES, SizeClasses};
use super::source::{AllocError, DEFAULT_REGION_SIZE, RegionSource, SystemSource};
use super::stats::{AllocatorStats, PoolCounters};
use crate::sync::OnceLock;

/// Configuration for [`PoolAllocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAllocatorConfig {
    /// Block shift of the smallest class (`2^min_block_shift` bytes, header
    /// included). Default: 5 (32 B). Must be at least 4.
    pub min_block_shift: u32,

    /// Block shift of the largest class. Default: 17 (128 KiB). Must be at
    /// most 30, and the two shifts may describe at most `MAX_CLASSES` classes.
    pub max_block_shift: u32,

    /// Size of each bulk mapping the default source makes. Default: 4 MiB.
    pub region_size: usize,

    /// Panic on a duplicate or invalid free instead of ignoring it.
    /// Default: false.
    pub strict_free: bool,
}

impl Default for PoolAllocatorConfig {
    fn default() -> Self {
        Self {
            min_block_shift: 5,
            max_block_shift: 17,
            region_size: DEFAULT_REGION_SIZE,
            strict_free: false,
        }
    }
}

/// Target of every zero-size allocation. Aligned to a page so that it also
/// satisfies any zero-size request with a strict alignment.
#[repr(C, align(4096))]
struct ZeroSentinel {
    _reserved: u64,
}

static ZERO_SENTINEL: ZeroSentinel = ZeroSentinel { _reserved: 0 };

/// Largest alignment the zero sentinel satisfies.
pub const ZERO_SENTINEL_ALIGN: usize = std::mem::align_of::<ZeroSentinel>();

/// The address returned for every zero-size request. Never dereferenced,
/// never freed, identical for every allocator in the process.
#[inline]
pub fn zero_sentinel() -> NonNull<u8> {
    NonNull::from(&ZERO_SENTINEL).cast::<u8>()
}

/// Pooled allocator implementing the realloc/free contract.
///
/// Blocks are carved from `S` one class-sized block at a time and recycled
/// through one free list per class. Fallback spans are parked and reused
/// the same way, per power of two. Nothing is ever unmapped.
pub struct PoolAllocator<S: SystemSource = RegionSource> {
    classes: SizeClasses,
    lists: [FreeList; MAX_CLASSES],
    fallback: FallbackCache,
    source: S,
    strict_free: bool,
    counters: PoolCounters,
}

impl PoolAllocator<RegionSource> {
    /// Allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if the default configuration is rejected by the
    /// platform (page size larger than half a region).
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(PoolAllocatorConfig::default())
    }

    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if the shifts or the region size
    /// are out of range.
    pub fn with_config(config: PoolAllocatorConfig) -> Result<Self, AllocError> {
        let source = RegionSource::new(config.region_size)?;
        Self::with_source(config, source)
    }
}

impl<S: SystemSource> PoolAllocator<S> {
    /// Allocator over a caller-supplied source. `config.region_size` is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if the shifts are out of range.
    pub fn with_source(config: PoolAllocatorConfig, source: S) -> Result<Self, AllocError> {
        let classes = SizeClasses::new(config.min_block_shift, config.max_block_shift)?;
        Ok(Self {
            classes,
            // No heap allocation: building the global instance must not recurse
            // into the allocator it is building.
            lists: std::array::from_fn(|_| FreeList::new()),
            fallback: FallbackCache::new(),
            source,
            strict_free: config.strict_free,
            counters: PoolCounters::default(),
        })
    }

    #[inline]
    pub fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> AllocatorStats {
        self.counters.snapshot()
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Returns the zero sentinel for `size == 0`, unless `align` exceeds
    /// [`ZERO_SENTINEL_ALIGN`]; such requests get a real zero-byte block.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` when the system source cannot supply the memory
    /// or the padded size overflows.
    pub fn try_alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        if size == 0 {
            if align <= ZERO_SENTINEL_ALIGN {
                return Ok(zero_sentinel());
            }
            return self.alloc_fallback(0, align);
        }
        match self.classes.classify(size) {
            Some(class) if align <= BASE_ALIGN => self.alloc_pooled(class),
            _ => self.alloc_fallback(size, align),
        }
    }

    /// [`try_alloc`](Self::try_alloc) that aborts the process on exhaustion.
    pub fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.try_alloc(size, align) {
            Ok(ptr) => ptr,
            Err(err) => exhausted(size, align, &err),
        }
    }

    #[inline]
    fn alloc_pooled(&self, class: ClassIndex) -> Result<NonNull<u8>, AllocError> {
        if let Some(node) = self.lists[class.get()].pop() {
            // Safety: every node on a free list is the payload of a pooled block.
            unsafe { BlockHeader::of(node) }.revive();
            self.counters.fast_path_hits.incr();
            self.counters.live_pooled_blocks.incr();
            return Ok(node);
        }

        let block_size = self.classes.block_size(class);
        let slot = self.source.obtain(block_size)?;
        self.counters.pooled_source_bytes.add(block_size);
        self.counters.blocks_created.incr();
        self.counters.live_pooled_blocks.incr();
        // Safety: the source hands out 16-aligned, exclusively owned memory of
        // at least block_size >= 16 bytes.
        Ok(unsafe { BlockHeader::stamp(slot, BlockState::Pooled, Some(class)) })
    }

    #[cold]
    fn alloc_fallback(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let block = self.fallback.allocate(&self.source, size, align)?;
        if block.reused {
            self.counters.fallback_reuses.incr();
        } else {
            self.counters.fallback_bytes.add(block.span_len);
        }
        self.counters.live_fallback_blocks.incr();
        Ok(block.payload)
    }

    /// Resize, allocate, or free through a single entry point.
    ///
    /// - `ptr` null (or the zero sentinel): allocate `new_size` bytes.
    /// - `new_size == 0`: free `ptr` and return what `try_alloc(0, align)`
    ///   returns (the zero sentinel unless `align` is stricter than a page).
    /// - The block already holds `new_size` bytes at base alignment: `ptr`.
    /// - Otherwise: move the first `min(old_size, new_size)` bytes into a new
    ///   block and free `ptr`.
    ///
    /// Never returns null.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if a new block is needed and cannot be obtained.
    /// `ptr` is left untouched in that case.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the zero sentinel, or a live pointer returned by
    /// this allocator, valid for reads of `old_size` bytes.
    pub unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        align: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let Some(existing) = NonNull::new(ptr) else {
            return self.try_alloc(new_size, align);
        };
        if existing == zero_sentinel() {
            return self.try_alloc(new_size, align);
        }
        if new_size == 0 {
            let empty = self.try_alloc(0, align)?;
            // Safety: upheld by caller.
            unsafe { self.free(ptr) };
            return Ok(empty);
        }

        // Safety: upheld by caller.
        if unsafe { self.fits_in_place(existing, old_size, align, new_size) } {
            self.counters.in_place_reallocs.incr();
            return Ok(existing);
        }

        let fresh = self.try_alloc(new_size, align)?;
        let count = old_size.min(new_size);
        // Safety: `existing` is valid for old_size bytes, `fresh` for new_size
        // bytes, and a live block never overlaps another.
        unsafe {
            std::ptr::copy_nonoverlapping(existing.as_ptr(), fresh.as_ptr(), count);
            self.free(ptr);
        }
        self.counters.copying_reallocs.incr();
        Ok(fresh)
    }

    /// [`try_realloc`](Self::try_realloc) that aborts the process on
    /// exhaustion.
    ///
    /// # Safety
    ///
    /// Same as [`try_realloc`](Self::try_realloc).
    pub unsafe fn realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        align: usize,
        new_size: usize,
    ) -> NonNull<u8> {
        // Safety: upheld by caller.
        match unsafe { self.try_realloc(ptr, old_size, align, new_size) } {
            Ok(ptr) => ptr,
            Err(err) => exhausted(new_size, align, &err),
        }
    }

    #[inline]
    unsafe fn fits_in_place(
        &self,
        existing: NonNull<u8>,
        old_size: usize,
        align: usize,
        new_size: usize,
    ) -> bool {
        if align > BASE_ALIGN {
            return false;
        }
        // Safety: upheld by caller.
        let header = unsafe { BlockHeader::of(existing) };
        match header.state() {
            Some(BlockState::Pooled) => header
                .class()
                .filter(|&class| self.classes.contains(class))
                .is_some_and(|class| new_size <= self.classes.usable_size(class)),
            Some(BlockState::Unpooled) => new_size <= old_size,
            _ => false,
        }
    }

    /// Return a block to the allocator.
    ///
    /// Null and the zero sentinel are ignored. A block that is already
    /// released is a benign duplicate and is ignored too, unless the
    /// allocator runs with `strict_free`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the zero sentinel, or a pointer this allocator
    /// returned (live or already freed). The payload must not be accessed
    /// after this call.
    ///
    /// # Panics
    ///
    /// With `strict_free`, panics on a duplicate free or a pointer whose
    /// header this allocator did not write.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        if payload == zero_sentinel() {
            return;
        }

        // Safety: upheld by caller.
        let header = unsafe { BlockHeader::of(payload) };
        if header.state().is_none() {
            self.invalid_free(payload);
            return;
        }

        match header.release() {
            Some(BlockState::Pooled) => {
                let Some(class) = header.class().filter(|&c| self.classes.contains(c)) else {
                    // A pooled tag with a class we never issue: leave the block
                    // off every list rather than corrupt one.
                    self.invalid_free(payload);
                    return;
                };
                self.counters.live_pooled_blocks.decr();
                // Safety: the successful release made us the sole owner, and
                // pooled payloads are 8-aligned with at least 8 bytes.
                unsafe { self.lists[class.get()].push(payload) };
            }
            Some(BlockState::Unpooled) => {
                self.counters.live_fallback_blocks.decr();
                // Safety: the successful release made us the sole owner of a
                // block the fallback cache stamped.
                unsafe { self.fallback.release(&self.source, payload) };
            }
            Some(BlockState::Released) | None => self.duplicate_free(payload),
        }
    }

    /// Bytes the block at `ptr` can hold without moving.
    ///
    /// Pooled blocks report their class capacity; the zero sentinel reports
    /// `Some(0)`. Fallback blocks, freed blocks and foreign pointers report
    /// `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the zero sentinel, or preceded by at least
    /// `HEADER_SIZE` readable, 8-aligned bytes.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let payload = NonNull::new(ptr.cast_mut())?;
        if payload == zero_sentinel() {
            return Some(0);
        }
        // Safety: upheld by caller.
        let header = unsafe { BlockHeader::of(payload) };
        match header.state()? {
            BlockState::Pooled => header
                .class()
                .filter(|&class| self.classes.contains(class))
                .map(|class| self.classes.usable_size(class)),
            BlockState::Unpooled | BlockState::Released => None,
        }
    }

    #[cold]
    fn duplicate_free(&self, payload: NonNull<u8>) {
        self.counters.duplicate_frees.incr();
        assert!(!self.strict_free, "double free of {payload:p}");
        log::trace!("ignoring duplicate free of {payload:p}");
    }

    #[cold]
    fn invalid_free(&self, payload: NonNull<u8>) {
        assert!(
            !self.strict_free,
            "free of {payload:p}, which this allocator did not hand out"
        );
        log::warn!("ignoring free of {payload:p}: no valid block header");
    }
}

impl<S: SystemSource> std::fmt::Debug for PoolAllocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("classes", &self.classes)
            .field("strict_free", &self.strict_free)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cold]
fn exhausted(size: usize, align: usize, err: &AllocError) -> ! {
    log::error!("allocation of {size} bytes (align {align}) failed: {err}");
    let layout = Layout::from_size_align(size.max(1), align.max(1)).unwrap_or(Layout::new::<u8>());
    std::alloc::handle_alloc_error(layout)
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

static GLOBAL_POOL_INSTANCE: OnceLock<PoolAllocator> = OnceLock::new();

/// Process-wide [`PoolAllocator`], created on first use and never torn down.
///
/// Backs the exported `cabi_realloc`/`cabi_free` symbols, and can be installed
/// as the `#[global_allocator]`.
pub struct GlobalPoolAllocator;

impl GlobalPoolAllocator {
    /// Install the process-wide allocator with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if the configuration is invalid or
    /// the instance already exists.
    pub fn init(config: PoolAllocatorConfig) -> Result<(), AllocError> {
        let allocator = PoolAllocator::with_config(config)?;
        let mut installed = false;
        GLOBAL_POOL_INSTANCE.get_or_init(|| {
            installed = true;
            allocator
        });
        if installed {
            Ok(())
        } else {
            Err(AllocError::InvalidConfig(
                "global pool allocator already initialized".to_string(),
            ))
        }
    }

    /// The process-wide allocator, created with the default configuration if
    /// [`init`](Self::init) was never called.
    pub fn get() -> &'static PoolAllocator {
        GLOBAL_POOL_INSTANCE.get_or_init(|| match PoolAllocator::new() {
            Ok(allocator) => allocator,
            Err(err) => {
                log::error!("cannot build the global pool allocator: {err}");
                std::process::abort()
            }
        })
    }
}

// Safety: Implementation follows GlobalAlloc contract.
unsafe impl std::alloc::GlobalAlloc for GlobalPoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match Self::get().try_alloc(layout.size(), layout.align()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Safety: ptr came from `alloc`/`realloc` on this allocator.
        unsafe { Self::get().free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Safety: ptr is a live block of layout.size() bytes from this allocator.
        match unsafe { Self::get().try_realloc(ptr, layout.size(), layout.align(), new_size) } {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }
}

use std::io;
use std::ptr::NonNull;

use thiserror::Error;

use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Alignment of every address a [`SystemSource`] hands out.
pub const SOURCE_ALIGN: usize = 16;

/// Default size of one bulk mapping.
pub const DEFAULT_REGION_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("system source exhausted: could not obtain {size} bytes")]
    SourceExhausted { size: usize },
    #[error("mapping {size} bytes failed: {source}")]
    MapFailed {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("allocation size overflow: {size} bytes with alignment {align}")]
    SizeOverflow { size: usize, align: usize },
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
}

/// Bulk memory the allocator builds blocks from.
///
/// Implementations must be safe to call concurrently, must return memory
/// aligned to [`SOURCE_ALIGN`], and never reclaim what they hand out while the
/// source is alive.
pub trait SystemSource: Send + Sync {
    /// Obtain `size` bytes of readable, writable memory.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` when the platform cannot satisfy the request.
    fn obtain(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Hint that the contents of `len` bytes at `ptr` are no longer needed.
    /// The range stays mapped and readable; its bytes become unspecified.
    ///
    /// The default does nothing.
    ///
    /// # Safety
    ///
    /// The range must lie inside memory this source handed out, and nothing
    /// may rely on its contents afterwards.
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) {
        let _ = (ptr, len);
    }
}

/// Raw page mappings.
pub(crate) trait VmOps {
    /// Map `size` bytes of zeroed read/write memory, aligned to at least the
    /// page size.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Unmap a range obtained from [`map`](VmOps::map) with the same `size`.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError>;

    /// Release the physical pages behind a page-aligned range while keeping
    /// it mapped. Reads afterwards see either the old bytes or zeroes.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{AllocError, NonNull, PlatformVmOps, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, AllocError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(AllocError::MapFailed {
                    size,
                    source: io::Error::last_os_error(),
                });
            }

            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| AllocError::MapFailed {
                size,
                source: io::Error::other("mmap returned null"),
            })
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(AllocError::MapFailed {
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
            // MADV_FREE: macOS (all versions), Linux >= 4.5. Pages stay mapped
            // and are reclaimed lazily under memory pressure.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(AllocError::MapFailed {
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if raw > 0 {
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    {
                        raw as usize
                    }
                } else {
                    4096
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Used under `cfg(loom)` / Miri, and on targets without mmap (wasm32 hosts
// included), where the platform's own allocator is the bulk source.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::MapFailed {
                size,
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero-size mapping"),
            });
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| AllocError::SizeOverflow { size, align: Self::page_size() })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(AllocError::SourceExhausted { size })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| AllocError::SizeOverflow { size, align: Self::page_size() })?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), AllocError> {
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// Bookkeeping at the start of every region mapping.
#[repr(C)]
struct Region {
    len: usize,
    cursor: AtomicUsize,
}

impl Region {
    /// First usable offset inside a region.
    const DATA_START: usize = std::mem::size_of::<Region>().next_multiple_of(SOURCE_ALIGN);

    /// Map a new region of `len` bytes and write its bookkeeping.
    fn map(len: usize) -> Result<NonNull<Region>, AllocError> {
        // Safety: FFI call to map; len is non-zero (checked by RegionSource::new).
        let base = unsafe { PlatformVmOps::map(len)? };
        let region = base.cast::<Region>();
        // Safety: the mapping is fresh, page aligned, and at least DATA_START long.
        unsafe {
            region.as_ptr().write(Region {
                len,
                cursor: AtomicUsize::new(Self::DATA_START),
            });
        }
        Ok(region)
    }

    /// Carve `size` bytes (already a multiple of `SOURCE_ALIGN`) off the region.
    #[inline]
    fn bump(&self, size: usize) -> Option<NonNull<u8>> {
        let mut start = self.cursor.load(Ordering::Relaxed);
        loop {
            let end = start.checked_add(size)?;
            if end > self.len {
                return None;
            }
            match self
                .cursor
                .compare_exchange_weak(start, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    let base = std::ptr::from_ref(self).cast::<u8>().cast_mut();
                    // Safety: start..end lies inside this mapping.
                    return NonNull::new(unsafe { base.add(start) });
                }
                Err(actual) => start = actual,
            }
        }
    }
}

/// Lock-free bump source over large page mappings.
///
/// ```text
///   current ──► ┌────────┬─────────┬─────────┬──────────────────────┐
///               │ Region │ block A │ block B │      unused ...      │
///               └────────┴─────────┴─────────┴──────────────────────┘
///                                            ▲ cursor
/// ```
///
/// When the current region runs dry a thread maps a replacement and tries to
/// install it with a CAS; a thread that loses the race unmaps its own copy
/// and bumps from the winner's. Retired regions are never unmapped, so blocks
/// carved from them stay valid for the life of the process. Requests larger
/// than a quarter of a region get a mapping of their own.
pub struct RegionSource {
    current: AtomicPtr<Region>,
    region_size: usize,
    mapped: AtomicUsize,
}

impl RegionSource {
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `region_size` is too small to
    /// hold its own bookkeeping plus one page.
    pub fn new(region_size: usize) -> Result<Self, AllocError> {
        let page = PlatformVmOps::page_size();
        if region_size < 2 * page {
            return Err(AllocError::InvalidConfig(format!(
                "region_size {region_size} must be at least two pages ({})",
                2 * page
            )));
        }
        Ok(Self {
            current: AtomicPtr::new(std::ptr::null_mut()),
            region_size: region_size.next_multiple_of(page),
            mapped: AtomicUsize::new(0),
        })
    }

    /// Total bytes mapped from the platform so far.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    #[inline]
    fn direct_threshold(&self) -> usize {
        self.region_size / 4
    }

    fn obtain_direct(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let len = size
            .checked_next_multiple_of(PlatformVmOps::page_size())
            .ok_or(AllocError::SizeOverflow {
                size,
                align: SOURCE_ALIGN,
            })?;
        // Safety: FFI call to map; len >= size > 0.
        let ptr = unsafe { PlatformVmOps::map(len)? };
        self.mapped.fetch_add(len, Ordering::Relaxed);
        log::debug!("mapped dedicated {len}-byte range at {ptr:p}");
        Ok(ptr)
    }
}

impl SystemSource for RegionSource {
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) {
        let page = PlatformVmOps::page_size();
        let start = (ptr.as_ptr() as usize).next_multiple_of(page);
        let end = (ptr.as_ptr() as usize + len) & !(page - 1);
        if end <= start {
            return;
        }
        // Keep provenance: offset from `ptr` rather than casting the address.
        // Safety: start lies inside [ptr, ptr + len).
        let first = unsafe { ptr.add(start - ptr.as_ptr() as usize) };
        // Safety: [start, end) is page aligned and inside memory we mapped.
        if let Err(err) = unsafe { PlatformVmOps::decommit(first, end - start) } {
            log::debug!("decommit of {} bytes at {first:p} failed: {err}", end - start);
        }
    }

    fn obtain(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = size
            .max(1)
            .checked_next_multiple_of(SOURCE_ALIGN)
            .ok_or(AllocError::SizeOverflow {
                size,
                align: SOURCE_ALIGN,
            })?;
        if size > self.direct_threshold() {
            return self.obtain_direct(size);
        }

        loop {
            let current = self.current.load(Ordering::Acquire);
            if let Some(region) = NonNull::new(current) {
                // Safety: installed regions are never unmapped.
                if let Some(ptr) = unsafe { region.as_ref() }.bump(size) {
                    return Ok(ptr);
                }
            }

            let fresh = Region::map(self.region_size)?;
            match self.current.compare_exchange(
                current,
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.mapped.fetch_add(self.region_size, Ordering::Relaxed);
                    log::debug!("mapped {}-byte region at {fresh:p}", self.region_size);
                }
                Err(_) => {
                    // Someone else installed a region first; ours was never visible.
                    // Safety: fresh came from Region::map with region_size.
                    unsafe {
                        drop(PlatformVmOps::unmap(fresh.cast::<u8>(), self.region_size));
                    }
                }
            }
        }
    }
}

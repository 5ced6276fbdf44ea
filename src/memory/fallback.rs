//! Route for requests no size class can serve: payloads larger than the
//! biggest class, or alignments stricter than [`BASE_ALIGN`].
//!
//! Every fallback block lives in a power-of-two *span* obtained from the
//! source:
//!
//! ```text
//!   base                                  payload = align_up(base + 40, align) on 64-bit
//!   ▼                                     ▼
//!   ┌──────┬──── padding ───┬──────────┬──┬──────────── size ───────┬──────┐
//!   │ link │                │ trailer  │H │         payload         │ ...  │
//!   └──────┴────────────────┴──────────┴──┴─────────────────────────┴──────┘
//!   ◄────────────────────────── span_len = 2^k bytes ───────────────────────►
//! ```
//!
//! The trailer records the span's base and length so `release` can find the
//! whole span from the payload. Released spans are parked on a free list per
//! power of two and handed out again to any later request that fits, whatever
//! its alignment. Large spans have their pages decommitted while parked.
//! Spans are never unmapped: a stale duplicate free must still find a
//! readable header.

use std::ptr::NonNull;

use super::free_list::FreeList;
use super::header::{BASE_ALIGN, BlockHeader, BlockState, HEADER_SIZE};
use super::source::{AllocError, SystemSource};

/// Bytes at the start of a span reserved for the free-list link while parked.
const LINK_ROOM: usize = 16;

/// Spans of at least this many bytes are decommitted while parked.
pub(crate) const DECOMMIT_THRESHOLD: usize = 64 * 1024;

const BUCKETS: usize = usize::BITS as usize;

#[repr(C)]
#[derive(Clone, Copy)]
struct SpanTrailer {
    base: usize,
    len: usize,
}

const TRAILER_SIZE: usize = std::mem::size_of::<SpanTrailer>();

/// Smallest offset of a payload from its span's base.
const MIN_PAYLOAD_OFFSET: usize = LINK_ROOM + TRAILER_SIZE + HEADER_SIZE;

/// A freshly stamped fallback block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FallbackBlock {
    pub payload: NonNull<u8>,
    /// Length of the span that holds the block.
    pub span_len: usize,
    /// `true` when the span was taken from the parked lists instead of the
    /// source.
    pub reused: bool,
}

/// Span length for a `size`/`align` fallback block.
#[inline]
pub(crate) fn span_len(size: usize, align: usize) -> Result<usize, AllocError> {
    let align = align.max(BASE_ALIGN);
    size.checked_add(align)
        .and_then(|n| n.checked_add(MIN_PAYLOAD_OFFSET))
        .and_then(usize::checked_next_power_of_two)
        .ok_or(AllocError::SizeOverflow { size, align })
}

/// Offset from `base` of the lowest `align`-aligned address that leaves room
/// for the link, the trailer and the header in front of it.
#[inline]
pub(crate) fn payload_offset(base: usize, align: usize) -> usize {
    let align = align.max(BASE_ALIGN);
    debug_assert!(align.is_power_of_two());
    let min_payload = base + MIN_PAYLOAD_OFFSET;
    let payload = (min_payload + align - 1) & !(align - 1);
    payload - base
}

/// Parked fallback spans, one free list per power of two.
pub(crate) struct FallbackCache {
    buckets: [FreeList; BUCKETS],
}

impl FallbackCache {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| FreeList::new()),
        }
    }

    /// Obtain and stamp a fallback block, reusing a parked span when one of
    /// the right length is available.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::SizeOverflow` if the span length does not fit in a
    /// `usize`, or whatever the source reports when it cannot supply the bytes.
    pub fn allocate<S: SystemSource + ?Sized>(
        &self,
        source: &S,
        size: usize,
        align: usize,
    ) -> Result<FallbackBlock, AllocError> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let len = span_len(size, align)?;
        let bucket = len.trailing_zeros() as usize;

        let (base, reused) = match self.buckets[bucket].pop() {
            Some(base) => (base, true),
            None => (source.obtain(len)?, false),
        };

        let offset = payload_offset(base.as_ptr() as usize, align);
        debug_assert!(offset + size <= len);

        // Safety: the trailer, the header and `size` payload bytes lie inside
        // the `len` bytes of a span nobody else owns; offset >= MIN_PAYLOAD_OFFSET.
        let payload = unsafe {
            let header = base.add(offset - HEADER_SIZE);
            header
                .sub(TRAILER_SIZE)
                .cast::<SpanTrailer>()
                .as_ptr()
                .write(SpanTrailer {
                    base: base.as_ptr() as usize,
                    len,
                });
            BlockHeader::stamp(header, BlockState::Unpooled, None)
        };

        if !reused {
            log::debug!(
                "fallback block: {size} bytes, align {align}, new {len}-byte span at {payload:p}"
            );
        }
        Ok(FallbackBlock {
            payload,
            span_len: len,
            reused,
        })
    }

    /// Park the span behind a fallback block whose header the caller has
    /// just moved from `Unpooled` to `Released`. Returns the span length.
    ///
    /// # Safety
    ///
    /// `payload` must come from [`allocate`](Self::allocate) on this cache,
    /// and the caller must have won the header's release CAS.
    pub unsafe fn release<S: SystemSource + ?Sized>(&self, source: &S, payload: NonNull<u8>) -> usize {
        // Safety: allocate wrote the trailer right before the header.
        let trailer = unsafe {
            payload
                .sub(HEADER_SIZE + TRAILER_SIZE)
                .cast::<SpanTrailer>()
                .as_ptr()
                .read()
        };
        debug_assert!(trailer.len.is_power_of_two());

        // Rebuild the base pointer from `payload` so it keeps its provenance.
        let offset = payload.as_ptr() as usize - trailer.base;
        // Safety: the span starts `offset` bytes before the payload.
        let base = unsafe { payload.sub(offset) };

        if trailer.len >= DECOMMIT_THRESHOLD {
            // Safety: the span is ours until pushed; the link room is skipped so
            // the push below writes into committed memory.
            unsafe { source.decommit(base.add(LINK_ROOM), trailer.len - LINK_ROOM) };
        }

        let bucket = trailer.len.trailing_zeros() as usize;
        // Safety: base is 16-aligned, LINK_ROOM bytes are reserved for the
        // link, and spans are never returned to the source.
        unsafe { self.buckets[bucket].push(base) };
        trailer.len
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::source::RegionSource;

    #[test]
    fn test_payload_offset_respects_prefix_and_alignment() {
        // Base already aligned: the prefix pushes the payload to the next boundary.
        assert_eq!(payload_offset(0x1000, 64), 64);
        assert_eq!(payload_offset(0x1000, 8), MIN_PAYLOAD_OFFSET);
        // Room for the prefix before the next boundary.
        assert_eq!(payload_offset(0x1010, 64), 0x30);
        // Small alignments are raised to the base alignment.
        assert_eq!(payload_offset(0x1000, 1), MIN_PAYLOAD_OFFSET);
    }

    #[test]
    fn test_span_len_is_power_of_two_and_overflow() {
        assert!(matches!(
            span_len(usize::MAX - 4, 8),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert!(matches!(
            span_len(usize::MAX / 2 + 1, 8),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert_eq!(span_len(24, 16).unwrap(), 128);
        assert_eq!(span_len(1 << 20, 8).unwrap(), 2 << 20);
    }

    #[test]
    fn test_allocate_stamps_unpooled_header() {
        let source = RegionSource::new(64 * 1024).unwrap();
        let cache = FallbackCache::new();
        for align in [8usize, 16, 64, 256, 4096] {
            let block = cache.allocate(&source, 300, align).unwrap();
            assert!((block.payload.as_ptr() as usize).is_multiple_of(align));
            assert!(!block.reused);
            // Safety: Test code.
            let header = unsafe { BlockHeader::of(block.payload) };
            assert_eq!(header.state(), Some(BlockState::Unpooled));
            assert_eq!(header.class(), None);
            // Safety: Test code.
            unsafe { std::ptr::write_bytes(block.payload.as_ptr(), 0xC3, 300) };
        }
    }

    #[test]
    fn test_released_span_is_reused_at_any_alignment() {
        let source = RegionSource::new(64 * 1024).unwrap();
        let cache = FallbackCache::new();
        let first = cache.allocate(&source, 40, 16).unwrap();
        // Safety: Test code.
        let header = unsafe { BlockHeader::of(first.payload) };
        assert_eq!(header.release(), Some(BlockState::Unpooled));
        // Safety: Test code.
        assert_eq!(unsafe { cache.release(&source, first.payload) }, first.span_len);

        let second = cache.allocate(&source, 30, 32).unwrap();
        assert!(second.reused);
        assert_eq!(second.span_len, first.span_len);
        assert!((second.payload.as_ptr() as usize).is_multiple_of(32));
        // Safety: Test code.
        unsafe { std::ptr::write_bytes(second.payload.as_ptr(), 0x99, 30) };
    }

    #[test]
    fn test_large_span_survives_decommit() {
        let source = RegionSource::new(64 * 1024).unwrap();
        let cache = FallbackCache::new();
        let size = 1 << 20;
        let block = cache.allocate(&source, size, 8).unwrap();
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(block.payload.as_ptr(), 0x5A, size);
            assert_eq!(BlockHeader::of(block.payload).release(), Some(BlockState::Unpooled));
            cache.release(&source, block.payload);
        }
        let mapped = source.mapped_bytes();

        let again = cache.allocate(&source, size, 8).unwrap();
        assert!(again.reused);
        assert_eq!(again.payload, block.payload);
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(again.payload.as_ptr(), 0xA5, size);
            assert_eq!(again.payload.as_ptr().add(size - 1).read(), 0xA5);
        }
        assert_eq!(source.mapped_bytes(), mapped);
    }
}

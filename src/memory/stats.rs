//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. A snapshot taken while other threads allocate may
//! be transiently inconsistent (e.g. `fast_path_hits` may already include an
//! allocation whose `live_pooled_blocks` increment is not yet visible). This
//! is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn decr(&self) {
        self.sub(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Live counters owned by one `PoolAllocator`.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    // Bytes obtained from the source for pooled blocks
    pub pooled_source_bytes: Counter,
    // Bytes obtained from the source for fallback spans
    pub fallback_bytes: Counter,
    pub fallback_reuses: Counter,
    pub fast_path_hits: Counter,
    pub blocks_created: Counter,
    pub in_place_reallocs: Counter,
    pub copying_reallocs: Counter,
    pub duplicate_frees: Counter,
    pub live_pooled_blocks: Counter,
    pub live_fallback_blocks: Counter,
}

impl PoolCounters {
    pub fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            pooled_source_bytes: self.pooled_source_bytes.get(),
            fallback_bytes: self.fallback_bytes.get(),
            fallback_reuses: self.fallback_reuses.get(),
            fast_path_hits: self.fast_path_hits.get(),
            blocks_created: self.blocks_created.get(),
            in_place_reallocs: self.in_place_reallocs.get(),
            copying_reallocs: self.copying_reallocs.get(),
            duplicate_frees: self.duplicate_frees.get(),
            live_pooled_blocks: self.live_pooled_blocks.get(),
            live_fallback_blocks: self.live_fallback_blocks.get(),
        }
    }
}

/// Point-in-time copy of an allocator's diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes taken from the system source to build pooled blocks.
    pub pooled_source_bytes: usize,
    /// Bytes taken from the system source for fallback spans. Released spans
    /// are parked and reused, never unmapped.
    pub fallback_bytes: usize,
    /// Fallback allocations served by a parked span.
    pub fallback_reuses: usize,
    /// Pooled allocations satisfied by popping a free list.
    pub fast_path_hits: usize,
    /// Pooled blocks carved fresh from the system source.
    pub blocks_created: usize,
    /// Reallocations that returned the existing pointer.
    pub in_place_reallocs: usize,
    /// Reallocations that moved the data to a new block.
    pub copying_reallocs: usize,
    /// Frees of blocks that were already released.
    pub duplicate_frees: usize,
    pub live_pooled_blocks: usize,
    pub live_fallback_blocks: usize,
}

impl std::fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pool Allocator Stats:")?;
        writeln!(
            f,
            "  Source:    {} KB pooled, {} KB fallback",
            self.pooled_source_bytes / 1024,
            self.fallback_bytes / 1024
        )?;
        writeln!(
            f,
            "  Allocs:    {} fast path, {} new blocks, {} fallback reuses",
            self.fast_path_hits, self.blocks_created, self.fallback_reuses
        )?;
        writeln!(
            f,
            "  Reallocs:  {} in place, {} copied",
            self.in_place_reallocs, self.copying_reallocs
        )?;
        writeln!(
            f,
            "  Live:      {} pooled, {} fallback",
            self.live_pooled_blocks, self.live_fallback_blocks
        )?;
        write!(f, "  Duplicate frees: {}", self.duplicate_frees)
    }
}

//! Private block header stamped immediately before every payload.
//!
//! ```text
//!   ┌────────────────┬──────────────┬──────────────────────────────┐
//!   │ state: u32     │ class: u32   │ payload ...                  │
//!   └────────────────┴──────────────┴──────────────────────────────┘
//!   ▲                                ▲
//!   payload - HEADER_SIZE            pointer handed to the caller
//! ```
//!
//! The header is part of the boundary layout, so its state tag is always the
//! 4-byte hardware atomic, even under `cfg(loom)`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use super::size_class::ClassIndex;

/// Size of the private header. Also the base alignment every payload honours.
pub const HEADER_SIZE: usize = 8;

/// Base alignment guaranteed by both the pooled and the fallback path.
pub const BASE_ALIGN: usize = HEADER_SIZE;

/// Class word stored for blocks that came from the fallback path.
const NO_CLASS: u32 = u32::MAX;

/// Lifecycle tag of a block.
///
/// The non-zero values are distinctive so that a stray pointer into foreign
/// memory is unlikely to pass as a live block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    /// Freed; either sitting on a free list or a retired fallback block.
    Released = 0,
    /// Live block owned by a size-class free list ("BLOK").
    Pooled = 0x424C_4F4B,
    /// Live block from the fallback path ("NONE").
    Unpooled = 0x4E4F_4E45,
}

impl BlockState {
    #[inline]
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Released),
            0x424C_4F4B => Some(Self::Pooled),
            0x4E4F_4E45 => Some(Self::Unpooled),
            _ => None,
        }
    }

    #[inline]
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Released)
    }
}

#[repr(C, align(8))]
pub(crate) struct BlockHeader {
    state: AtomicU32,
    class: u32,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == HEADER_SIZE);
const _: () = assert!(HEADER_SIZE.is_power_of_two());

impl BlockHeader {
    /// Header belonging to `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by this allocator (or be otherwise
    /// preceded by at least `HEADER_SIZE` readable, 8-aligned bytes).
    #[inline]
    pub unsafe fn of<'a>(payload: NonNull<u8>) -> &'a BlockHeader {
        // Safety: upheld by caller.
        unsafe { &*payload.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>() }
    }

    /// Write a fresh header at `slot` and return the payload that follows it.
    ///
    /// # Safety
    ///
    /// `slot` must be 8-aligned and valid for writes of `HEADER_SIZE` bytes,
    /// and nothing else may be reading the header concurrently.
    #[inline]
    pub unsafe fn stamp(slot: NonNull<u8>, state: BlockState, class: Option<ClassIndex>) -> NonNull<u8> {
        debug_assert!((slot.as_ptr() as usize).is_multiple_of(BASE_ALIGN));
        let header = BlockHeader {
            state: AtomicU32::new(state as u32),
            class: class.map_or(NO_CLASS, ClassIndex::raw),
        };
        // Safety: upheld by caller.
        unsafe {
            slot.as_ptr().cast::<BlockHeader>().write(header);
            slot.add(HEADER_SIZE)
        }
    }

    /// Current state, or `None` when the tag is not one this allocator writes.
    #[inline]
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn class(&self) -> Option<ClassIndex> {
        ClassIndex::from_raw(self.class)
    }

    /// Atomically retire a live block. Returns the state the block was in, or
    /// `None` if another caller got there first (or the tag was never live).
    #[inline]
    pub fn release(&self) -> Option<BlockState> {
        let current = self.state()?;
        if !current.is_live() {
            return None;
        }
        self.state
            .compare_exchange(
                current as u32,
                BlockState::Released as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| current)
    }

    /// Mark a block popped from a free list as live again.
    #[inline]
    pub fn revive(&self) {
        debug_assert_eq!(self.state(), Some(BlockState::Released));
        self.state.store(BlockState::Pooled as u32, Ordering::Release);
    }
}

//! Taking ownership of buffers the host filled through `realloc`.
//!
//! A host writes results (strings, lists) into memory it obtained from our
//! `realloc` and passes back `(ptr, len)`. [`HostBuffer`] ties that pair to
//! the allocator so the block is freed exactly once, whether the data is read
//! in place or copied out into owned Rust memory.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::string::FromUtf8Error;

use super::facade::PoolAllocator;
use super::source::SystemSource;

/// Borrowed view of a host-filled block. Frees the block on drop.
pub struct HostBuffer<'a, S: SystemSource> {
    allocator: &'a PoolAllocator<S>,
    ptr: *mut u8,
    len: usize,
}

impl<S: SystemSource> PoolAllocator<S> {
    /// Adopt `len` bytes at `ptr` that the host wrote into a block from this
    /// allocator.
    ///
    /// A null `ptr` or zero `len` yields an empty buffer; the pointer is still
    /// freed on drop.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the zero sentinel, or a live block from this
    /// allocator holding at least `len` initialised bytes, and nothing else may
    /// free or access it while the `HostBuffer` exists.
    pub unsafe fn adopt(&self, ptr: *mut u8, len: usize) -> HostBuffer<'_, S> {
        HostBuffer {
            allocator: self,
            ptr,
            len: if ptr.is_null() { 0 } else { len },
        }
    }
}

impl<S: SystemSource> HostBuffer<'_, S> {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Copy the bytes into a `Vec` and free the block.
    pub fn into_vec(self) -> Vec<u8> {
        self.to_vec()
    }

    /// Copy the bytes into a `String` and free the block. The block is freed
    /// even when the bytes are not UTF-8.
    ///
    /// # Errors
    ///
    /// Returns `FromUtf8Error` (holding the copied bytes) for invalid UTF-8.
    pub fn into_string(self) -> Result<String, FromUtf8Error> {
        String::from_utf8(self.into_vec())
    }
}

impl<S: SystemSource> Deref for HostBuffer<'_, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // Safety: `adopt` guarantees len initialised bytes at a non-null ptr.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<S: SystemSource> DerefMut for HostBuffer<'_, S> {
    fn deref_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // Safety: as above, and the buffer is the block's only owner.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<S: SystemSource> Drop for HostBuffer<'_, S> {
    fn drop(&mut self) {
        // Safety: `adopt` guarantees ptr is null, the sentinel, or ours.
        unsafe { self.allocator.free(self.ptr) };
    }
}

impl<S: SystemSource> std::fmt::Debug for HostBuffer<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &NonNull::new(self.ptr))
            .field("len", &self.len)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Per-class free list (ABA-safe Treiber stack over a 128-bit CAS)
// ----------------------------------------------------------------------------

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU128, AtomicUsize, Ordering};
use crate::sync::hint;

/// 128-bit tagged pointer for ABA-safe Treiber stack operations.
///
/// Packed into a single `u128` for double-width compare-and-swap (DWCAS):
///
/// ```text
///   bits [127:64]  generation counter  (64 bits)
///   bits [63:0]    pointer             (64 bits, full address)
/// ```
///
/// Even generations mean the head is stable. An odd generation means a `pop`
/// has reserved the head node and is reading its link; everybody else waits
/// for it to go even again. Every successful transition moves the generation
/// forward, so a node that is popped, reused, freed, and pushed back at the
/// same address never satisfies a stale CAS.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: *mut u8, generation: u64) -> Self {
        Self(u128::from(generation) << 64 | (ptr as usize as u128))
    }

    #[inline]
    fn ptr(self) -> *mut u8 {
        (self.0 as u64 as usize) as *mut u8
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    #[inline]
    fn is_reserved(self) -> bool {
        !self.generation().is_multiple_of(2)
    }
}

impl std::fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
    }
}

/// Link word overlaid on the first bytes of a freed payload.
///
/// # Safety
///
/// `node` must be at least `size_of::<usize>()`-aligned and point to at least
/// that many bytes the free list currently owns.
#[inline]
unsafe fn link_of(node: *mut u8) -> *mut AtomicUsize {
    debug_assert!(
        (node as usize).is_multiple_of(std::mem::align_of::<usize>()),
        "free-list node is not word aligned: {node:p}",
    );
    node.cast::<AtomicUsize>()
}

/// RAII guard that restores the head if a `pop` unwinds while holding the
/// reservation.
struct PopReservation<'a> {
    head: &'a AtomicU128,
    old: TaggedPtr,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // We own the reservation (odd generation). Put the old pointer back
            // with the next even generation.
            let restored = TaggedPtr::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.head.store(restored.0, Ordering::Release);
        }
    }
}

/// One size class worth of freed blocks.
///
/// Nodes are the payloads of released blocks; the first word of each payload
/// holds the link to the next node. The stack never allocates and never
/// returns memory anywhere: it only threads blocks the caller hands it.
///
/// # Progress
///
/// The list is CAS-based but not lock-free in the strict sense. Between the
/// reserve and commit steps of [`pop`](Self::pop) the head carries an odd
/// generation, and every other `push` or `pop` on the same list spins until
/// it turns even. A thread descheduled inside that window stalls the whole
/// class for as long as it is off the CPU, so the reservation behaves like a
/// short per-class spinlock. The window covers one relaxed load and one CAS.
/// Other classes are unaffected.
pub(crate) struct FreeList {
    head: AtomicU128,
}

// Safety: FreeList only uses atomics; the nodes it threads are owned by the list.
unsafe impl Send for FreeList {}
// Safety: all shared access goes through the atomic head and reservation protocol.
unsafe impl Sync for FreeList {}

impl FreeList {
    pub fn new() -> Self {
        Self {
            head: AtomicU128::new(TaggedPtr::NULL.0),
        }
    }

    /// Push `node` onto the stack.
    ///
    /// # Safety
    ///
    /// `node` must be word aligned, point to at least one word of memory that
    /// stays valid for the list's lifetime, and must not be reachable by any
    /// other owner (the caller has already retired its header).
    pub unsafe fn push(&self, node: NonNull<u8>) {
        let node = node.as_ptr();
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));

            // A pop holds the head; wait for it to settle.
            if old.is_reserved() {
                hint::spin_loop();
                continue;
            }

            // The node is still private to us, so a plain write initialises the
            // link; the Release CAS below publishes it.
            // Safety: upheld by caller.
            unsafe {
                link_of(node).write(AtomicUsize::new(old.ptr() as usize));
            }

            let new = TaggedPtr::new(node, old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop a node, or `None` if the stack is empty. The popped node's link
    /// word is zeroed before it is returned.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));
            if old.is_null() {
                return None;
            }

            if old.is_reserved() {
                hint::spin_loop();
                continue;
            }

            // Step 1: Reserve the head (even -> odd). While reserved, nobody can
            // pop the node out from under us and hand it to a caller.
            let reserved = TaggedPtr::new(old.ptr(), old.generation().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.0, reserved.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut guard = PopReservation {
                head: &self.head,
                old,
                committed: false,
            };

            // Step 2: Read the link. The node is pinned by the reservation.
            // Safety: nodes on the list are valid until popped.
            let next = unsafe { (*link_of(old.ptr())).load(Ordering::Relaxed) } as *mut u8;

            // Step 3: Commit (odd -> even).
            let stable = TaggedPtr::new(next, old.generation().wrapping_add(2));
            let res = self.head.compare_exchange(
                reserved.0,
                stable.0,
                Ordering::Release,
                Ordering::Relaxed,
            );
            debug_assert!(res.is_ok(), "FreeList::pop reservation broken!");
            guard.committed = true;

            // Safety: the node is ours now; clear the stale link.
            unsafe { (*link_of(old.ptr())).store(0, Ordering::Relaxed) };
            return NonNull::new(old.ptr());
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        TaggedPtr(self.head.load(Ordering::Acquire)).is_null()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::collections::HashSet;

    #[repr(C, align(16))]
    struct Node([u8; 32]);

    fn nodes(n: usize) -> Vec<Box<Node>> {
        (0..n).map(|_| Box::new(Node([0; 32]))).collect()
    }

    fn as_node(n: &mut Node) -> NonNull<u8> {
        NonNull::from(&mut n.0).cast::<u8>()
    }

    #[test]
    fn test_tagged_ptr_packing() {
        let p = 0x1000 as *mut u8;
        let t = TaggedPtr::new(p, 7);
        assert_eq!(t.ptr(), p);
        assert_eq!(t.generation(), 7);
        assert!(t.is_reserved());
        assert!(!TaggedPtr::new(p, 8).is_reserved());
        assert!(TaggedPtr::NULL.is_null());
    }

    #[test]
    fn test_pop_empty() {
        let list = FreeList::new();
        assert!(list.pop().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_push_pop_is_lifo() {
        let list = FreeList::new();
        let mut storage = nodes(3);
        let ptrs: Vec<_> = storage.iter_mut().map(|n| as_node(n)).collect();
        for &p in &ptrs {
            // Safety: Test code.
            unsafe { list.push(p) };
        }
        assert_eq!(list.pop(), Some(ptrs[2]));
        assert_eq!(list.pop(), Some(ptrs[1]));
        assert_eq!(list.pop(), Some(ptrs[0]));
        assert!(list.pop().is_none());
    }

    #[test]
    fn test_pop_clears_link() {
        let list = FreeList::new();
        let mut storage = nodes(2);
        let a = as_node(&mut storage[0]);
        let b = as_node(&mut storage[1]);
        // Safety: Test code.
        unsafe {
            list.push(a);
            list.push(b);
        }
        let popped = list.pop().unwrap();
        assert_eq!(popped, b);
        // Safety: Test code.
        let link = unsafe { popped.cast::<usize>().as_ptr().read() };
        assert_eq!(link, 0);
    }

    #[test]
    fn test_generation_advances_on_reuse() {
        let list = FreeList::new();
        let mut storage = nodes(1);
        let a = as_node(&mut storage[0]);
        // Safety: Test code.
        unsafe { list.push(a) };
        let before = TaggedPtr(list.head.load(Ordering::Relaxed));
        list.pop().unwrap();
        // Safety: Test code.
        unsafe { list.push(a) };
        let after = TaggedPtr(list.head.load(Ordering::Relaxed));
        assert_eq!(before.ptr(), after.ptr());
        assert_ne!(before.generation(), after.generation());
        assert!(!after.is_reserved());
    }

    #[test]
    fn test_concurrent_transfer_preserves_every_node() {
        let list = Arc::new(FreeList::new());
        let total = 4096usize;
        for _ in 0..total {
            let p = Box::leak(Box::new(Node([0; 32]))).0.as_mut_ptr();
            // Safety: Test code.
            unsafe { list.push(NonNull::new(p).unwrap()) };
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = list.clone();
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..10_000 {
                        if i % 3 == 2 {
                            if let Some(p) = held.pop() {
                                // Safety: Test code.
                                unsafe { list.push(p) };
                            }
                        } else if let Some(p) = list.pop() {
                            held.push(p);
                        }
                    }
                    for p in held {
                        // Safety: Test code.
                        unsafe { list.push(p) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(p) = list.pop() {
            assert!(seen.insert(p.as_ptr() as usize));
        }
        assert_eq!(seen.len(), total);
    }
}

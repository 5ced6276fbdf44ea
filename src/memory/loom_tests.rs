/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the CAS-based free list, the header state CAS and the counters
/// under every thread interleaving loom can explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Loop iterations minimised to 1–2 per thread.
///   - Allocator tests build a fresh `PoolAllocator` per iteration over a
///     small leaking heap source; `RegionSource` regions are far too large
///     to map once per iteration.
///   - `GlobalPoolAllocator` is NOT tested directly bc its OnceLock static
///     does not reset between loom iterations. Everything it does is
///     reachable through instance-based tests.
///   - The free list spins while the head is reserved (odd generation), which
///     blows up the state space; free-list tests use `preemption_bound(2)`.
///   - Nodes carry a loom-tracked `AtomicUsize` at offset 0, so payloads used
///     here are at least 56 bytes.
#[cfg(loom)]
mod tests {
    use std::ptr::NonNull;

    use crate::memory::facade::{PoolAllocator, PoolAllocatorConfig};
    use crate::memory::source::{AllocError, SOURCE_ALIGN, SystemSource};
    use crate::sync::Arc;

    // =====================================================================
    // Helpers
    // =====================================================================

    /// Allocate a 64-byte aligned buffer with a loom-tracked `AtomicUsize` at
    /// the free-list link offset (bytes 0..8).
    fn alloc_fake_node() -> (NonNull<u8>, std::alloc::Layout) {
        let layout = std::alloc::Layout::from_size_align(64, 64).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let nn = NonNull::new(ptr).expect("alloc failed");
        unsafe {
            std::ptr::write(
                nn.as_ptr().cast::<crate::sync::atomic::AtomicUsize>(),
                crate::sync::atomic::AtomicUsize::new(0),
            );
        }
        (nn, layout)
    }

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    /// Hands out leaked heap blocks. Small enough to run once per iteration.
    struct LeakSource;

    impl SystemSource for LeakSource {
        fn obtain(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
            let layout = std::alloc::Layout::from_size_align(size, SOURCE_ALIGN)
                .map_err(|_| AllocError::SizeOverflow { size, align: SOURCE_ALIGN })?;
            NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
                .ok_or(AllocError::SourceExhausted { size })
        }
    }

    fn pool() -> PoolAllocator<LeakSource> {
        PoolAllocator::with_source(PoolAllocatorConfig::default(), LeakSource).unwrap()
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. FreeList: 128-bit tagged Treiber stack
    // =====================================================================

    #[test]
    fn loom_free_list_push_pop_single_thread() {
        use crate::memory::free_list::FreeList;

        bounded(2).check(|| {
            let list = FreeList::new();
            let (node, layout) = alloc_fake_node();

            unsafe { list.push(node) };
            assert_eq!(list.pop(), Some(node));
            assert!(list.pop().is_none());

            unsafe { std::alloc::dealloc(node.as_ptr(), layout) };
        });
    }

    #[test]
    fn loom_free_list_concurrent_push() {
        use crate::memory::free_list::FreeList;

        bounded(2).check(|| {
            let list = Arc::new(FreeList::new());
            let (node_a, layout_a) = alloc_fake_node();
            let (node_b, layout_b) = alloc_fake_node();

            let l1 = list.clone();
            let l2 = list.clone();
            let na = node_a.as_ptr() as usize;
            let nb = node_b.as_ptr() as usize;

            let t1 = loom::thread::spawn(move || {
                unsafe { l1.push(NonNull::new(na as *mut u8).unwrap()) };
            });
            let t2 = loom::thread::spawn(move || {
                unsafe { l2.push(NonNull::new(nb as *mut u8).unwrap()) };
            });

            t1.join().unwrap();
            t2.join().unwrap();

            let mut popped = Vec::new();
            while let Some(p) = list.pop() {
                popped.push(p.as_ptr() as usize);
            }
            assert_eq!(popped.len(), 2);
            assert!(popped.contains(&na));
            assert!(popped.contains(&nb));

            unsafe {
                std::alloc::dealloc(node_a.as_ptr(), layout_a);
                std::alloc::dealloc(node_b.as_ptr(), layout_b);
            }
        });
    }

    #[test]
    fn loom_free_list_concurrent_pop_hands_out_each_node_once() {
        use crate::memory::free_list::FreeList;

        bounded(2).check(|| {
            let list = Arc::new(FreeList::new());
            let (node_a, layout_a) = alloc_fake_node();
            let (node_b, layout_b) = alloc_fake_node();
            unsafe {
                list.push(node_a);
                list.push(node_b);
            }

            let l1 = list.clone();
            let l2 = list.clone();
            let t1 = loom::thread::spawn(move || l1.pop().map(|p| p.as_ptr() as usize));
            let t2 = loom::thread::spawn(move || l2.pop().map(|p| p.as_ptr() as usize));

            let a = t1.join().unwrap().unwrap();
            let b = t2.join().unwrap().unwrap();
            assert_ne!(a, b);
            assert!(list.pop().is_none());

            unsafe {
                std::alloc::dealloc(node_a.as_ptr(), layout_a);
                std::alloc::dealloc(node_b.as_ptr(), layout_b);
            }
        });
    }

    #[test]
    fn loom_free_list_push_while_pop() {
        use crate::memory::free_list::FreeList;

        bounded(2).check(|| {
            let list = Arc::new(FreeList::new());
            let (node_a, layout_a) = alloc_fake_node();
            let (node_b, layout_b) = alloc_fake_node();

            unsafe { list.push(node_a) };

            let l_push = list.clone();
            let l_pop = list.clone();
            let nb = node_b.as_ptr() as usize;

            let t_push = loom::thread::spawn(move || {
                unsafe { l_push.push(NonNull::new(nb as *mut u8).unwrap()) };
            });
            let t_pop = loom::thread::spawn(move || l_pop.pop().map(|p| p.as_ptr() as usize));

            t_push.join().unwrap();
            let popped = t_pop.join().unwrap();

            let mut remaining = Vec::new();
            while let Some(p) = list.pop() {
                remaining.push(p.as_ptr() as usize);
            }
            assert_eq!(remaining.len() + usize::from(popped.is_some()), 2);
            if let Some(p) = popped {
                assert!(!remaining.contains(&p));
            }

            unsafe {
                std::alloc::dealloc(node_a.as_ptr(), layout_a);
                std::alloc::dealloc(node_b.as_ptr(), layout_b);
            }
        });
    }

    // =====================================================================
    // 3. PoolAllocator: header CAS plus free list
    // =====================================================================

    /// Two threads free the same block: exactly one push, one duplicate.
    #[test]
    fn loom_racing_double_free_pushes_once() {
        bounded(2).check(|| {
            let a = Arc::new(pool());
            let p = a.alloc(56, 8).as_ptr() as usize;

            let a1 = a.clone();
            let a2 = a.clone();
            let t1 = loom::thread::spawn(move || unsafe { a1.free(p as *mut u8) });
            let t2 = loom::thread::spawn(move || unsafe { a2.free(p as *mut u8) });
            t1.join().unwrap();
            t2.join().unwrap();

            let stats = a.stats();
            assert_eq!(stats.duplicate_frees, 1);
            assert_eq!(stats.live_pooled_blocks, 0);

            assert_eq!(a.alloc(56, 8).as_ptr() as usize, p);
            assert_ne!(a.alloc(56, 8).as_ptr() as usize, p);
        });
    }

    /// One thread frees while another allocates from the same class.
    #[test]
    fn loom_alloc_while_free() {
        bounded(2).check(|| {
            let a = Arc::new(pool());
            let p = a.alloc(56, 8).as_ptr() as usize;

            let a1 = a.clone();
            let a2 = a.clone();
            let t_free = loom::thread::spawn(move || unsafe { a1.free(p as *mut u8) });
            let t_alloc = loom::thread::spawn(move || a2.alloc(56, 8).as_ptr() as usize);
            t_free.join().unwrap();
            let q = t_alloc.join().unwrap();

            // Either q reused p after the free, or it is a fresh block and p
            // is still on the list.
            let r = a.alloc(56, 8).as_ptr() as usize;
            assert_ne!(q, r);
            assert!(q == p || r == p);
        });
    }
}

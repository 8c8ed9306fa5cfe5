use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{block::HEADER_ALIGN, heap::Heap, trace::trace, Pointer};

/// The only alignment this allocator guarantees: whatever the block header
/// layout naturally produces, which is one machine word. Content always
/// starts right after a word aligned header, stricter requests are refused.
const NATURAL_ALIGNMENT: usize = HEADER_ALIGN;

/// Thread safe handle over the allocator. This is the public API: the four
/// classic allocation operations plus a [`GlobalAlloc`] implementation on
/// top of them.
///
/// # Examples
///
/// ## Standalone usage
///
/// ```rust
/// use mapalloc::Mapalloc;
///
/// let allocator = Mapalloc::new();
///
/// let address = allocator.allocate(128);
/// assert!(!address.is_null());
///
/// unsafe {
///     address.write_bytes(42, 128);
///     assert_eq!(*address.add(127), 42);
///     allocator.deallocate(address);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use mapalloc::Mapalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Mapalloc = Mapalloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Mapalloc {
    /// Currently we serialize everything behind one global [`Mutex`], which
    /// is as simple as a concurrency story gets: every public entry point
    /// acquires the lock at the boundary and every observable effect of an
    /// operation is published when the lock is released. Some ideas to
    /// improve multithreaded throughput later: shard the heap into a fixed
    /// number of independent heaps and pick one per thread (round-robin or
    /// by thread id hash), or keep small per-thread caches of recently
    /// released blocks in front of the shared heap. Both change the
    /// teardown condition, since no single heap would know whether the
    /// whole allocator is idle, so they are not free.
    heap: Mutex<Heap>,
}

unsafe impl Sync for Mapalloc {}

impl Mapalloc {
    /// Builds a new allocator with an empty heap. No memory is mapped until
    /// the first allocation request.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Allocates `size` bytes and returns the address of the first one, or
    /// a null pointer when the request is refused (`size == 0`) or memory
    /// is exhausted. The returned address is aligned to one machine word.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let (address, mapped) = match self.heap.lock() {
            Ok(mut heap) => {
                let regions_before = heap.region_count();
                let address = unsafe { heap.allocate(size) };
                (address, heap.region_count() > regions_before)
            }
            Err(_) => (None, false),
        };

        if mapped {
            trace!("[mapalloc] mapped a new region for allocate({})", size);
        }
        trace!("[mapalloc] allocate({}) -> {:p}", size, into_raw(address));

        into_raw(address)
    }

    /// Allocates an array of `count` elements of `size` bytes each, all set
    /// to zero. Returns null when either factor is zero, when `count *
    /// size` overflows, or when memory is exhausted.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let address = match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate_zeroed(count, size) },
            Err(_) => None,
        };

        trace!(
            "[mapalloc] allocate_zeroed({}, {}) -> {:p}",
            count,
            size,
            into_raw(address)
        );

        into_raw(address)
    }

    /// Resizes the allocation at `address` to `new_size` bytes, moving the
    /// content to a new block. A null `address` behaves like
    /// [`Mapalloc::allocate`]; `new_size == 0` behaves like
    /// [`Mapalloc::deallocate`] and returns null. On failure the old
    /// allocation is left untouched and null is returned.
    ///
    /// # Safety
    ///
    /// A non-null `address` must have been returned by this allocator and
    /// not deallocated yet. The old address is invalid after a successful
    /// call.
    pub unsafe fn reallocate(&self, address: *mut u8, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            self.deallocate(address);
            return ptr::null_mut();
        }

        let Some(address) = NonNull::new(address) else {
            return self.allocate(new_size);
        };

        let new_address = match self.heap.lock() {
            Ok(mut heap) => heap.reallocate(address, new_size),
            Err(_) => None,
        };

        trace!(
            "[mapalloc] reallocate({:p}, {}) -> {:p}",
            address.as_ptr(),
            new_size,
            into_raw(new_address)
        );

        into_raw(new_address)
    }

    /// Releases the allocation at `address`. Null is a no-op. Releasing the
    /// last live allocation returns every mapped region to the kernel.
    ///
    /// # Safety
    ///
    /// A non-null `address` must have been returned by this allocator and
    /// not deallocated yet.
    pub unsafe fn deallocate(&self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        let torn_down = match self.heap.lock() {
            Ok(mut heap) => heap.deallocate(address),
            Err(_) => false,
        };

        trace!("[mapalloc] deallocate({:p})", address.as_ptr());
        if torn_down {
            trace!("[mapalloc] heap entirely free, all regions returned");
        }
    }
}

impl Default for Mapalloc {
    fn default() -> Self {
        Mapalloc::new()
    }
}

unsafe impl GlobalAlloc for Mapalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > NATURAL_ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > NATURAL_ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate_zeroed(layout.size(), 1)
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.deallocate(address)
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > NATURAL_ALIGNMENT {
            return ptr::null_mut();
        }

        self.reallocate(address, new_size)
    }
}

/// Shorter syntax for converting internal results into the C style
/// null-on-failure convention of the public API.
#[inline]
fn into_raw(address: Pointer<u8>) -> *mut u8 {
    address.map_or(ptr::null_mut(), NonNull::as_ptr)
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    fn verify_heap_is_empty(allocator: &Mapalloc) {
        assert!(!allocator.heap.lock().unwrap().is_initialized());
    }

    #[test]
    fn allocations_dont_step_on_each_other() {
        let allocator = Mapalloc::new();

        unsafe {
            let first = allocator.allocate(8);
            first.write_bytes(69, 8);

            let second = allocator.allocate(16 * 1024);
            second.write_bytes(42, 16 * 1024);

            for i in 0..8 {
                assert_eq!(*first.add(i), 69);
            }

            allocator.deallocate(first);

            for i in 0..16 * 1024 {
                assert_eq!(*second.add(i), 42);
            }

            allocator.deallocate(second);
        }

        verify_heap_is_empty(&allocator);
    }

    #[test]
    fn zeroed_allocations() {
        let allocator = Mapalloc::new();

        unsafe {
            let address = allocator.allocate_zeroed(32, 4);
            assert!(!address.is_null());

            for i in 0..128 {
                assert_eq!(*address.add(i), 0);
            }

            allocator.deallocate(address);
        }

        assert!(allocator.allocate_zeroed(usize::MAX, 2).is_null());
        assert!(allocator.allocate_zeroed(0, 4).is_null());

        verify_heap_is_empty(&allocator);
    }

    #[test]
    fn reallocate_covers_the_classic_contract() {
        let allocator = Mapalloc::new();

        unsafe {
            // Null address behaves like a fresh allocation.
            let address = allocator.reallocate(ptr::null_mut(), 64);
            assert!(!address.is_null());

            for i in 0..64 {
                *address.add(i) = i as u8;
            }

            // Growing moves the content.
            let grown = allocator.reallocate(address, 8192);
            assert!(!grown.is_null());
            for i in 0..64 {
                assert_eq!(*grown.add(i), i as u8);
            }

            // Zero size behaves like a release.
            assert!(allocator.reallocate(grown, 0).is_null());
        }

        verify_heap_is_empty(&allocator);
    }

    #[test]
    fn zero_sized_and_null_requests() {
        let allocator = Mapalloc::new();

        assert!(allocator.allocate(0).is_null());
        unsafe { allocator.deallocate(ptr::null_mut()) };

        // Refused requests must not leave a mapping behind.
        verify_heap_is_empty(&allocator);
    }

    #[test]
    fn global_alloc_refuses_unsupported_alignment() {
        let allocator = Mapalloc::new();

        unsafe {
            let strict = Layout::from_size_align(64, NATURAL_ALIGNMENT * 2).unwrap();
            assert!(allocator.alloc(strict).is_null());
            assert!(allocator.alloc_zeroed(strict).is_null());

            let natural = Layout::from_size_align(64, NATURAL_ALIGNMENT).unwrap();
            let address = allocator.alloc(natural);
            assert!(!address.is_null());
            assert_eq!(address as usize % NATURAL_ALIGNMENT, 0);
            allocator.dealloc(address, natural);
        }

        verify_heap_is_empty(&allocator);
    }

    /// All threads allocate at the same time, then wait, then all release
    /// at the same time.
    #[test]
    fn multiple_threads_synchronized_allocs_and_deallocs() {
        let allocator = Mapalloc::new();

        let num_threads = 8;

        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for thread_index in 0..num_threads {
                let barrier = &barrier;
                let allocator = &allocator;

                scope.spawn(move || unsafe {
                    let num_bytes = 1024;
                    let marker = thread_index as u8;

                    let address = allocator.allocate(num_bytes);
                    assert!(!address.is_null());
                    address.write_bytes(marker, num_bytes);

                    barrier.wait();

                    // Check memory corruption.
                    for i in 0..num_bytes {
                        assert_eq!(*address.add(i), marker);
                    }

                    allocator.deallocate(address);
                });
            }
        });

        verify_heap_is_empty(&allocator);
    }

    /// In this case the threads do allocs and deallocs interchangeably.
    #[test]
    fn multiple_threads_unsynchronized_allocs_and_deallocs() {
        let allocator = Mapalloc::new();

        let num_threads = 8;

        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                let barrier = &barrier;
                let allocator = &allocator;

                scope.spawn(move || unsafe {
                    // Different sizes so contention over a single region
                    // and multiple regions are both exercised.
                    let sizes = [16, 256, 1024, 2048, 4096, 8192];

                    // Miri is really slow, but we don't need as many
                    // operations to find bugs with it.
                    let num_allocs = if cfg!(miri) { 10 } else { 500 };

                    for size in sizes {
                        barrier.wait();
                        for round in 0..num_allocs {
                            let address = allocator.allocate(size);
                            assert!(!address.is_null());

                            if cfg!(miri) {
                                // Since Miri is slow we won't write all the
                                // bytes, just a few to catch data races. If
                                // two threads ever receive the same
                                // address, Miri will catch that.
                                let offsets = [0, size / 2, size - 1];
                                for offset in offsets {
                                    *address.add(offset) = round as u8;
                                }
                                for offset in offsets {
                                    assert_eq!(*address.add(offset), round as u8);
                                }
                            } else {
                                for i in 0..size {
                                    *address.add(i) = (i % 256) as u8;
                                }
                                for i in 0..size {
                                    assert_eq!(*address.add(i), (i % 256) as u8);
                                }
                            }

                            allocator.deallocate(address);
                        }
                    }
                });
            }
        });

        verify_heap_is_empty(&allocator);
    }
}

use std::{
    cmp,
    ptr::{self, NonNull},
};

use crate::{
    arith,
    block::{total_block_size_for, Block, MIN_BLOCK_SIZE},
    freelist::FreeList,
    list::{Header, LinkedList},
    platform,
    region::{determine_region_length, Region, INIT_SIZE, REGION_HEADER_SIZE},
    Pointer,
};

/// The allocator state machine. Owns every mapping requested from the
/// kernel (the region registry) and the index of released blocks (the free
/// list). This struct is not thread safe and needs mutable borrows to
/// operate, so it has to be wrapped in some container like
/// [`std::sync::Mutex`]; see [`crate::Mapalloc`] for the public API. Keeping
/// the state in an explicit value instead of a process global also means
/// every test can work on its own fresh heap.
///
/// Lifecycle: the heap starts empty and maps its first region lazily on the
/// first allocation. Further regions are mapped whenever no free block can
/// satisfy a request. As soon as a release leaves every mapped byte free,
/// the whole heap is torn down and the next allocation starts over.
pub(crate) struct Heap {
    /// All regions currently mapped for this heap.
    regions: LinkedList<Region>,
    /// Released blocks, ordered by address.
    free_blocks: FreeList,
    /// Sum of the sizes of all mapped regions, excluding region headers.
    /// Equivalently, the total size of all blocks, free or not.
    size: usize,
}

impl Heap {
    /// Builds a new heap with no mappings. No allocations happen until the
    /// first request comes in.
    pub const fn new() -> Self {
        Self {
            regions: LinkedList::new(),
            free_blocks: FreeList::new(),
            size: 0,
        }
    }

    /// Whether the heap currently owns any mapping.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.regions.len() > 0
    }

    /// Number of regions currently mapped.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Returns an address where `size` bytes can be safely written, or
    /// `None` when the request is refused (`size == 0`, arithmetic
    /// overflow) or the kernel is out of memory.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        // The block must hold the requested bytes plus its own header, with
        // the content length rounded up so that the header written by a
        // later split still lands on an aligned address.
        let request = total_block_size_for(size)?;

        if !self.is_initialized() {
            self.init()?;
        }

        let block = match self.free_blocks.find_fit(request) {
            Some(block) => block,
            None => self.expand(request)?,
        };

        self.split_if_possible(block, request);
        self.free_blocks.remove(block);

        Some(block.as_ref().data.content)
    }

    /// Allocates space for an array of `count` elements of `size` bytes
    /// each and fills it with zeros. Refused on zero factors and on
    /// products that don't fit in [`usize`].
    pub unsafe fn allocate_zeroed(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = arith::checked_array_size(count, size)?;

        let address = self.allocate(total)?;
        address.as_ptr().write_bytes(0, total);

        Some(address)
    }

    /// Moves the allocation at `address` into a block that can hold
    /// `new_size` bytes, preserving as much of the old content as fits. On
    /// failure returns `None` and the old allocation stays untouched and
    /// valid.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this heap and not released yet.
    pub unsafe fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        let old_block = Header::<Block>::from_content_address(address);

        let new_address = self.allocate(new_size)?;

        // Copy the content, not the header: the old block stores its total
        // size, the caller only ever owned the bytes after the header.
        let count = cmp::min(new_size, old_block.as_ref().content_size());
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);

        self.deallocate(address);

        Some(new_address)
    }

    /// Releases the allocation at `address`. The block is indexed again and
    /// merged with any address-adjacent free neighbours; if that leaves the
    /// whole heap free, every region is returned to the kernel. Returns
    /// `true` when the heap was torn down.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this heap and not released yet.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) -> bool {
        let block = Header::<Block>::from_content_address(address);

        self.free_blocks.insert(block);

        if self.free_blocks.total_free() == self.size {
            self.teardown();
            return true;
        }

        false
    }

    /// Maps the first region and carves the initial free block out of it.
    /// On failure the heap stays untouched and the triggering request must
    /// fail.
    unsafe fn init(&mut self) -> Option<()> {
        let address = platform::request_memory(INIT_SIZE)?;

        let region = self.regions.append(
            Region {
                size: INIT_SIZE - REGION_HEADER_SIZE,
            },
            address,
        );

        let block = Header::<Block>::write_at(
            Header::first_block_address_of(region),
            region.as_ref().size(),
        );

        self.free_blocks.insert(block);
        self.size = region.as_ref().size();

        Some(())
    }

    /// Maps an additional region big enough for a block of `request` total
    /// bytes and indexes it as one free block. Invoked when no free block
    /// can satisfy a request; on map failure the free list is left exactly
    /// as it was.
    unsafe fn expand(&mut self, request: usize) -> Pointer<Header<Block>> {
        let length = determine_region_length(request)?;

        let address = platform::request_memory(length)?;

        let region = self.regions.append(
            Region {
                size: length - REGION_HEADER_SIZE,
            },
            address,
        );

        let block = Header::<Block>::write_at(
            Header::first_block_address_of(region),
            region.as_ref().size(),
        );

        self.size += region.as_ref().size();
        self.free_blocks.insert(block);

        Some(block)
    }

    /// Block splitting algorithm. Let's say a request needs `T` total bytes
    /// and first fit found a block of `S > T` total bytes. We cut the block
    /// in two so the tail stays allocatable:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block   |     +-----------+
    ///         |     |  Content  | <- S bytes total.
    ///         +-->  +-----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block 1 |     +-----------+
    ///         |     |  Content  | <- T bytes total.
    ///         +-->  +-----------+
    ///         |     |   Header  |
    /// Block 2 |     +-----------+
    ///         |     |  Content  | <- S - T bytes total.
    ///         +-->  +-----------+
    /// ```
    ///
    /// The cut only happens when the remainder can still hold a header plus
    /// at least one content byte; otherwise the caller simply gets the
    /// whole block and the extra bytes ride along unused.
    unsafe fn split_if_possible(&mut self, mut block: NonNull<Header<Block>>, request: usize) {
        if block.as_ref().size() - request < MIN_BLOCK_SIZE {
            return;
        }

        // `request` is a multiple of the header alignment, so the remainder
        // header lands on an aligned address.
        let remainder_address =
            NonNull::new_unchecked(block.cast::<u8>().as_ptr().add(request));
        let remainder_size = block.as_ref().size() - request;

        // The remainder sits right after the block being split, so it can
        // be linked in place without an ordered walk.
        let remainder = remainder_address.cast::<Header<Block>>();
        self.free_blocks.insert_after(
            block,
            Block {
                size: remainder_size,
                content: Header::content_address_of(remainder),
            },
            remainder_address,
        );

        block.as_mut().data.size = request;
    }

    /// Returns every region to the kernel and resets the heap to its
    /// pristine state. Only called when all mapped bytes are free. Unmap
    /// failures are ignored; the heap forgets the region either way and the
    /// next allocation starts from scratch.
    unsafe fn teardown(&mut self) {
        let mut current = self.regions.first();

        while let Some(region) = current {
            // Read the link before the node's memory disappears.
            current = region.as_ref().next;
            platform::return_memory(region.cast(), region.as_ref().total_size());
        }

        self.regions.clear();
        self.free_blocks.clear();
        self.size = 0;
    }
}

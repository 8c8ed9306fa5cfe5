use std::{mem, ptr::NonNull};

use crate::list::{Header, Node};

/// Block header size in bytes. See [`Header<T>`] and [`Block`].
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Header<Block>>();

/// Minimum total block size in bytes: a header plus at least one content
/// byte. The splitting algorithm refuses to create anything smaller because
/// such a fragment could never satisfy an allocation.
pub(crate) const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + 1;

/// Alignment every header address must satisfy, one machine word in
/// practice. The header stores pointers, so writing or reading one at a
/// misaligned address is undefined behaviour, not just slow.
pub(crate) const HEADER_ALIGN: usize = mem::align_of::<Header<Block>>();

/// Total block size needed to serve a request for `size` content bytes.
/// Blocks are carved back to back, so the content length is rounded up to
/// [`HEADER_ALIGN`]; without the rounding, splitting a block after an odd
/// request would place the remainder's header at a misaligned address, and
/// the content pointer handed out for that remainder would be misaligned
/// too. Returns `None` when the rounded size overflows.
pub(crate) fn total_block_size_for(size: usize) -> Option<usize> {
    let aligned = size.checked_add(HEADER_ALIGN - 1)? & !(HEADER_ALIGN - 1);

    aligned.checked_add(BLOCK_HEADER_SIZE)
}

/// Memory block specific data. All headers are also linked list nodes, see
/// [`Header<T>`]. A complete block header is [`Node<Block>`], also known as
/// [`Header<Block>`]. Here's how a block looks like in memory:
///
/// ```text
/// +----------------------------+          <----------------------+
/// | pointer to next block      |   <------+                      |
/// +----------------------------+          | Pointer<Node<Block>> |
/// | pointer to prev block      |   <------+                      |
/// +----------------------------+                                 | <Node<Block>>
/// | total block size           |          +--+                   |
/// +----------------------------+          | Block                |
/// | pointer to content         |   <------+                      |
/// +----------------------------+          <----------------------+
/// |       Block content        |   <------+
/// |            ...             |          | Addressable content
/// |            ...             |   <------+
/// +----------------------------+
/// ```
///
/// The `next` and `prev` links are only meaningful while the block is
/// indexed by the free list; for a block handed out to a caller they are
/// dead weight and never inspected. The content pointer is redundant (it
/// always equals the address right after the header) but it makes the
/// header ↔ user pointer relationship explicit and it is the exact value
/// returned to callers.
pub(crate) struct Block {
    /// Total size of the block in bytes, including [`BLOCK_HEADER_SIZE`].
    pub size: usize,
    /// Address of the first content byte, right after this header.
    pub content: NonNull<u8>,
}

impl Header<Block> {
    /// Writes a fresh, unlinked block header at `address` spanning `size`
    /// total bytes.
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` is valid, aligned to
    /// [`HEADER_ALIGN`] and that `size` bytes starting at it are owned by
    /// the allocator.
    pub unsafe fn write_at(address: NonNull<u8>, size: usize) -> NonNull<Self> {
        let header = address.cast::<Self>();
        let content = Self::content_address_of(header);

        header.as_ptr().write(Node {
            next: None,
            prev: None,
            data: Block { size, content },
        });

        header
    }

    /// Returns the block header that owns the given content address. This
    /// is how a released pointer finds its way back to its block:
    ///
    /// ```text
    /// +--------------+
    /// | Block header | <- Returned address points here.
    /// +--------------+
    /// |   Content    | <- Given address points here.
    /// +--------------+
    /// |     ...      |
    /// +--------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `address` must be the content address of a block created by this
    /// allocator, that is, a pointer previously handed out and not released
    /// yet. Anything else is undefined behaviour.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Address of the first content byte of the block at `header`, the
    /// inverse of [`Header::from_content_address`].
    ///
    /// # Safety
    ///
    /// `header` must point to a valid block header. The result is safe to
    /// use for up to [`Header::content_size`] bytes.
    ///
    /// # Notes
    ///
    /// We are using this as `Header::content_address_of(header)` instead of
    /// `header.content_address()` because we want to avoid creating
    /// intermediary references to `self` to keep Miri happy. See
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Total block size including [`BLOCK_HEADER_SIZE`].
    #[inline]
    pub fn size(&self) -> usize {
        self.data.size
    }

    /// Content bytes available to the caller.
    #[inline]
    pub fn content_size(&self) -> usize {
        self.data.size - BLOCK_HEADER_SIZE
    }

    /// First byte past the end of the block. Two blocks are address-adjacent
    /// when the end address of the first one equals the base address of the
    /// second one.
    ///
    /// # Safety
    ///
    /// `header` must point to a valid block header.
    #[inline]
    pub unsafe fn end_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.cast::<u8>().as_ptr().add(header.as_ref().data.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Arena([u8; 256]);

    #[test]
    fn block_layout() {
        let mut arena = Arena([0; 256]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();

        unsafe {
            let block = Header::<Block>::write_at(base, 128);

            assert_eq!(block.as_ref().size(), 128);
            assert_eq!(block.as_ref().content_size(), 128 - BLOCK_HEADER_SIZE);
            assert_eq!(block.as_ref().next, None);
            assert_eq!(block.as_ref().prev, None);

            // The content self-pointer, the typed conversion and raw
            // pointer arithmetic must all agree.
            let content = Header::content_address_of(block);
            assert_eq!(block.as_ref().data.content, content);
            assert_eq!(
                content.as_ptr(),
                base.as_ptr().add(BLOCK_HEADER_SIZE)
            );
            assert_eq!(Header::from_content_address(content), block);

            assert_eq!(
                Header::end_address_of(block).as_ptr(),
                base.as_ptr().add(128)
            );
        }
    }

    #[test]
    fn request_rounding() {
        assert_eq!(
            total_block_size_for(1),
            Some(BLOCK_HEADER_SIZE + HEADER_ALIGN)
        );
        assert_eq!(
            total_block_size_for(HEADER_ALIGN),
            Some(BLOCK_HEADER_SIZE + HEADER_ALIGN)
        );
        assert_eq!(
            total_block_size_for(HEADER_ALIGN + 1),
            Some(BLOCK_HEADER_SIZE + 2 * HEADER_ALIGN)
        );

        // Rounding near the top of the address space must refuse, not wrap.
        assert_eq!(total_block_size_for(usize::MAX), None);
        assert_eq!(total_block_size_for(usize::MAX - BLOCK_HEADER_SIZE), None);

        // Whatever the request, the total keeps the next header aligned.
        for size in 1..=4 * HEADER_ALIGN {
            assert_eq!(total_block_size_for(size).unwrap() % HEADER_ALIGN, 0);
        }
    }
}

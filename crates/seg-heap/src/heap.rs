//! The allocator engine: fit search, splitting, coalescing, and growth.

use core::fmt;

use arena::{Arena, WORD};
use snafu::{OptionExt as _, Snafu};

use crate::{
    ALIGNMENT, BASE, CHUNK_SIZE, ConsistencyReport, INITIAL_EXTEND, MIN_BLOCK, PROLOGUE_HEADER,
    check, index,
    tag::{self, BlockTag},
};

/// Errors that can occur while constructing a [`Heap`].
///
/// Once a heap exists the allocation paths never error: exhaustion is
/// reported as `None` and invalid use is a benign no-op.
#[derive(Debug, Snafu)]
pub enum HeapError {
    /// The arena limit cannot even hold the sentinel table and the
    /// prologue/epilogue markers.
    #[snafu(display("arena limit of {limit} bytes cannot hold the heap bootstrap structures"))]
    Bootstrap {
        limit: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The arena limit cannot hold the initial free-space extension.
    #[snafu(display(
        "arena limit of {limit} bytes cannot hold the initial {extend}-byte extension"
    ))]
    InitialExtend {
        limit: usize,
        extend: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Handle to an allocated block: the byte offset of its payload within the
/// arena.
///
/// A `BlockPtr` is only as valid as the allocation it came from. Using one
/// after the block has been deallocated or moved by
/// [`reallocate`](Heap::reallocate) reads whatever occupies those bytes now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BlockPtr(usize);

impl BlockPtr {
    pub(crate) fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Byte offset of the payload within the arena.
    #[must_use]
    pub fn offset(self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

/// Rounds a payload request up to a legal block size: one header word of
/// overhead, aligned, and never below the minimum block.
fn adjusted_size(size: usize) -> usize {
    if size + WORD <= MIN_BLOCK {
        MIN_BLOCK
    } else {
        (size + WORD + ALIGNMENT - 1) & !(ALIGNMENT - 1)
    }
}

/// A segregated-fit heap over a growable arena.
///
/// See the [crate documentation](crate) for the algorithm and the arena
/// layout. Constructed with [`Heap::new`] or [`Heap::with_limit`]; the four
/// allocation operations mirror the C allocator quartet of `malloc`, `free`,
/// `realloc`, and `calloc`.
#[derive(Debug)]
pub struct Heap {
    pub(crate) arena: Arena,
    /// Payload offset of the epilogue marker, always the arena end.
    pub(crate) epilogue: usize,
}

impl Heap {
    /// Creates a heap backed by an arena with the default growth limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit cannot hold the bootstrap structures
    /// and the initial extension; with the default limit this cannot happen.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_limit(Arena::DEFAULT_LIMIT)
    }

    /// Creates a heap whose arena never grows past `limit` bytes.
    ///
    /// The heap immediately claims space for the bucket sentinel table and
    /// the prologue/epilogue markers, then extends itself by
    /// [`INITIAL_EXTEND`] bytes of free space.
    ///
    /// # Errors
    ///
    /// Returns an error if `limit` cannot hold those structures.
    pub fn with_limit(limit: usize) -> Result<Self, HeapError> {
        let mut arena = Arena::with_limit(limit);
        arena.grow(BASE).context(BootstrapSnafu { limit })?;

        arena.set_word(PROLOGUE_HEADER, BlockTag::new(2 * WORD, true, true).word());
        arena.set_word(tag::header(BASE), BlockTag::new(0, true, true).word());

        let mut heap = Self {
            arena,
            epilogue: BASE,
        };
        heap.extend(INITIAL_EXTEND).context(InitialExtendSnafu {
            limit,
            extend: INITIAL_EXTEND,
        })?;
        Ok(heap)
    }

    /// Allocates a block with at least `size` usable bytes.
    ///
    /// A zero `size` is a defined no-op returning `None`. Exhaustion of the
    /// arena limit also returns `None`; the heap stays usable and a smaller
    /// request may still succeed.
    pub fn allocate(&mut self, size: usize) -> Option<BlockPtr> {
        self.verify("allocate:enter");
        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size);
        let bp = match index::find_fit(&self.arena, asize) {
            Some(bp) => bp,
            None => self.extend(asize.max(CHUNK_SIZE))?,
        };
        index::remove(&mut self.arena, bp);
        let bp = self.place(bp, asize);
        self.verify("allocate:exit");
        Some(BlockPtr::new(bp))
    }

    /// Returns a block to the free lists, merging it with free neighbors.
    ///
    /// `None` is a defined no-op, the analogue of `free(NULL)`.
    pub fn deallocate(&mut self, ptr: Option<BlockPtr>) {
        let Some(ptr) = ptr else {
            return;
        };
        self.verify("deallocate:enter");
        let bp = ptr.offset();

        let tag = tag::load(&self.arena, bp).with_allocated(false);
        tag::store(&mut self.arena, bp, tag);
        tag::store_footer(&mut self.arena, bp, tag);

        let next = tag::next_block(&self.arena, bp);
        let next_tag = tag::load(&self.arena, next).with_prev_allocated(false);
        tag::store(&mut self.arena, next, next_tag);

        self.coalesce(bp);
        self.verify("deallocate:exit");
    }

    /// Resizes a block, moving it if it cannot stay where it is.
    ///
    /// `size == 0` deallocates and returns `None`; a `None` pointer is a
    /// plain allocation. If the existing block already holds the adjusted
    /// size it is returned unchanged. Otherwise the contents move to a fresh
    /// block and the old one is freed; on allocation failure the old block
    /// is left intact and `None` is returned.
    pub fn reallocate(&mut self, ptr: Option<BlockPtr>, size: usize) -> Option<BlockPtr> {
        if size == 0 {
            self.deallocate(ptr);
            return None;
        }
        let Some(old) = ptr else {
            return self.allocate(size);
        };

        let asize = adjusted_size(size);
        let old_size = tag::load(&self.arena, old.offset()).size();
        if old_size >= asize {
            return Some(old);
        }

        let new = self.allocate(size)?;
        let new_size = tag::load(&self.arena, new.offset()).size();
        let copy_len = old_size.min(new_size) - WORD;
        self.arena.copy(old.offset(), new.offset(), copy_len);
        self.deallocate(Some(old));
        Some(new)
    }

    /// Allocates a zero-filled block for `count` elements of `size` bytes.
    ///
    /// The byte count is computed with wrapping multiplication; the result
    /// of a request whose product overflows is unspecified, though never
    /// unsound.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<BlockPtr> {
        let total = count.wrapping_mul(size);
        let ptr = self.allocate(total)?;
        let len = self.payload_len(ptr);
        self.arena.fill(ptr.offset(), len, 0);
        Some(ptr)
    }

    /// Borrows the usable bytes of an allocated block.
    ///
    /// The slice is at least as long as the size passed to
    /// [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// May panic if `ptr` does not refer to a live allocation.
    #[must_use]
    pub fn payload(&self, ptr: BlockPtr) -> &[u8] {
        let len = self.payload_len(ptr);
        self.arena.bytes(ptr.offset(), len)
    }

    /// Mutably borrows the usable bytes of an allocated block.
    ///
    /// # Panics
    ///
    /// May panic if `ptr` does not refer to a live allocation.
    #[must_use]
    pub fn payload_mut(&mut self, ptr: BlockPtr) -> &mut [u8] {
        let len = self.payload_len(ptr);
        self.arena.bytes_mut(ptr.offset(), len)
    }

    /// Runs the heap-consistency checker without mutating anything.
    ///
    /// The `context` tag is echoed in the report so call sites can be told
    /// apart in diagnostics.
    #[must_use]
    pub fn check_consistency(&self, context: &str) -> ConsistencyReport {
        check::run(self, context)
    }

    fn payload_len(&self, ptr: BlockPtr) -> usize {
        tag::load(&self.arena, ptr.offset()).size() - WORD
    }

    /// Grows the arena by `bytes`, turning the grown space plus the old
    /// epilogue slot into one free block and planting a fresh epilogue at
    /// the new end. The block is coalesced with a free predecessor and
    /// inserted into the index; its final offset is returned.
    fn extend(&mut self, bytes: usize) -> Option<usize> {
        let bp = self.arena.grow(bytes)?;

        let prev_allocated = tag::load(&self.arena, self.epilogue).prev_allocated();
        let free = BlockTag::new(bytes, prev_allocated, false);
        tag::store(&mut self.arena, bp, free);
        tag::store_footer(&mut self.arena, bp, free);

        self.epilogue += bytes;
        tag::store(&mut self.arena, self.epilogue, BlockTag::new(0, false, true));

        Some(self.coalesce(bp))
    }

    /// Boundary-tag coalescing. Merges the free block at `bp` with whichever
    /// of its address neighbors are free, unlinking them first, and inserts
    /// the merged block into the index. Returns the merged block's offset.
    fn coalesce(&mut self, bp: usize) -> usize {
        let tag = tag::load(&self.arena, bp);
        let next = bp + tag.size();
        let next_allocated = tag::load(&self.arena, next).is_allocated();

        let mut bp = bp;
        let mut size = tag.size();
        match (tag.prev_allocated(), next_allocated) {
            (true, true) => {}
            (false, true) => {
                let prev = tag::prev_block(&self.arena, bp);
                index::remove(&mut self.arena, prev);
                size += tag::load(&self.arena, prev).size();
                bp = prev;
            }
            (true, false) => {
                index::remove(&mut self.arena, next);
                size += tag::load(&self.arena, next).size();
            }
            (false, false) => {
                let prev = tag::prev_block(&self.arena, bp);
                index::remove(&mut self.arena, prev);
                index::remove(&mut self.arena, next);
                size += tag::load(&self.arena, prev).size() + tag::load(&self.arena, next).size();
                bp = prev;
            }
        }

        let merged = tag::load(&self.arena, bp).with_size(size);
        tag::store(&mut self.arena, bp, merged);
        tag::store_footer(&mut self.arena, bp, merged);
        index::insert(&mut self.arena, bp);
        bp
    }

    /// Carves `asize` bytes out of the free block at `bp`, which must
    /// already be unlinked. A remainder worth keeping becomes a new free
    /// block; one too small to stand alone is handed out with the block.
    fn place(&mut self, bp: usize, asize: usize) -> usize {
        let tag = tag::load(&self.arena, bp);
        let remainder = tag.size() - asize;

        if remainder <= MIN_BLOCK {
            tag::store(&mut self.arena, bp, tag.with_allocated(true));
            let next = tag::next_block(&self.arena, bp);
            let next_tag = tag::load(&self.arena, next).with_prev_allocated(true);
            tag::store(&mut self.arena, next, next_tag);
        } else {
            tag::store(
                &mut self.arena,
                bp,
                BlockTag::new(asize, tag.prev_allocated(), true),
            );
            let rest = bp + asize;
            let rest_tag = BlockTag::new(remainder, true, false);
            tag::store(&mut self.arena, rest, rest_tag);
            tag::store_footer(&mut self.arena, rest, rest_tag);
            index::insert(&mut self.arena, rest);
        }
        bp
    }

    #[cfg(feature = "self-verify")]
    fn verify(&self, context: &str) {
        let report = self.check_consistency(context);
        assert!(report.is_clean(), "{report}");
    }

    #[cfg(not(feature = "self-verify"))]
    fn verify(&self, _context: &str) {}
}

//! Block boundary-tag codec and block layout arithmetic.
//!
//! A block's header is one arena word. The size occupies the high bits and
//! is always a multiple of [`ALIGNMENT`], which leaves the low bits free for
//! status flags:
//!
//! ```text
//! ┌─────────────────────────────────────────────┬───┬───┬───┬───┐
//! │ size (multiple of ALIGNMENT)                │ 0 │ 0 │ P │ A │
//! └─────────────────────────────────────────────┴───┴───┴───┴───┘
//!                                                       P = previous block allocated
//!                                                       A = this block allocated
//! ```
//!
//! Blocks are identified by their payload offset `bp`; the header sits one
//! word below. Free blocks repeat the header word in a footer at the end of
//! the block so that a successor can find the free block's start, which is
//! the backward half of boundary-tag coalescing. Allocated blocks have no
//! footer; their successor learns their status from its own `P` bit.

use arena::{Arena, WORD};
use bitflags::bitflags;

use crate::ALIGNMENT;

bitflags! {
    /// Status bits stored in the low bits of a block header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TagBits: usize {
        /// This block is allocated.
        const ALLOCATED = 1 << 0;

        /// The block immediately before this one in address order is
        /// allocated.
        const PREV_ALLOCATED = 1 << 1;
    }
}

const BITS_MASK: usize = ALIGNMENT - 1;
const SIZE_MASK: usize = !BITS_MASK;

const _: () = assert!(SIZE_MASK & BITS_MASK == 0);
const _: () = assert!(TagBits::all().bits() & SIZE_MASK == 0);

/// One packed block header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct BlockTag(usize);

impl BlockTag {
    /// Packs a size and the two status bits into a tag.
    ///
    /// # Panics
    ///
    /// Panics if `size` has any of its low alignment bits set.
    pub(crate) fn new(size: usize, prev_allocated: bool, allocated: bool) -> Self {
        assert!(size & BITS_MASK == 0, "block size must be aligned");
        let mut bits = TagBits::empty();
        if allocated {
            bits |= TagBits::ALLOCATED;
        }
        if prev_allocated {
            bits |= TagBits::PREV_ALLOCATED;
        }
        Self(size | bits.bits())
    }

    pub(crate) fn from_word(word: usize) -> Self {
        Self(word)
    }

    pub(crate) fn word(self) -> usize {
        self.0
    }

    pub(crate) fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    fn bits(self) -> TagBits {
        TagBits::from_bits_truncate(self.0)
    }

    pub(crate) fn is_allocated(self) -> bool {
        self.bits().contains(TagBits::ALLOCATED)
    }

    pub(crate) fn prev_allocated(self) -> bool {
        self.bits().contains(TagBits::PREV_ALLOCATED)
    }

    /// Returns the tag with only the size replaced.
    ///
    /// # Panics
    ///
    /// Panics if `size` has any of its low alignment bits set.
    pub(crate) fn with_size(self, size: usize) -> Self {
        assert!(size & BITS_MASK == 0, "block size must be aligned");
        Self((self.0 & BITS_MASK) | size)
    }

    /// Returns the tag with only the allocated bit replaced.
    pub(crate) fn with_allocated(self, allocated: bool) -> Self {
        if allocated {
            Self(self.0 | TagBits::ALLOCATED.bits())
        } else {
            Self(self.0 & !TagBits::ALLOCATED.bits())
        }
    }

    /// Returns the tag with only the prev-allocated bit replaced.
    pub(crate) fn with_prev_allocated(self, prev_allocated: bool) -> Self {
        if prev_allocated {
            Self(self.0 | TagBits::PREV_ALLOCATED.bits())
        } else {
            Self(self.0 & !TagBits::PREV_ALLOCATED.bits())
        }
    }

    /// Compares two tags the way header and footer must agree: same size and
    /// allocated bit. The prev-allocated bit is meaningless in a footer and
    /// is ignored.
    pub(crate) fn agrees_with(self, other: Self) -> bool {
        let relevant = !TagBits::PREV_ALLOCATED.bits();
        self.0 & relevant == other.0 & relevant
    }
}

/// Offset of the header word of the block with payload offset `bp`.
pub(crate) fn header(bp: usize) -> usize {
    bp - WORD
}

/// Reads the header tag of the block at `bp`.
pub(crate) fn load(arena: &Arena, bp: usize) -> BlockTag {
    BlockTag::from_word(arena.word(header(bp)))
}

/// Writes the header tag of the block at `bp`.
pub(crate) fn store(arena: &mut Arena, bp: usize, tag: BlockTag) {
    arena.set_word(header(bp), tag.word());
}

/// Offset of the footer word of a block of `size` bytes at `bp`.
pub(crate) fn footer(bp: usize, size: usize) -> usize {
    bp + size - 2 * WORD
}

/// Reads the footer tag of the block at `bp`, using its header for the size.
pub(crate) fn load_footer(arena: &Arena, bp: usize) -> BlockTag {
    BlockTag::from_word(arena.word(footer(bp, load(arena, bp).size())))
}

/// Writes `tag` to the footer position its own size dictates. Only free
/// blocks carry footers.
pub(crate) fn store_footer(arena: &mut Arena, bp: usize, tag: BlockTag) {
    arena.set_word(footer(bp, tag.size()), tag.word());
}

/// Payload offset of the block following `bp` in address order.
pub(crate) fn next_block(arena: &Arena, bp: usize) -> usize {
    bp + load(arena, bp).size()
}

/// Payload offset of the block preceding `bp` in address order.
///
/// Valid only while the preceding block is free: the size is read from its
/// footer, and allocated blocks do not have one.
pub(crate) fn prev_block(arena: &Arena, bp: usize) -> usize {
    let footer = BlockTag::from_word(arena.word(bp - 2 * WORD));
    bp - footer.size()
}

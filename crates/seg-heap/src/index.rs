//! Segregated free-list index.
//!
//! Free blocks are threaded through the arena itself: each bucket owns one
//! sentinel word at the very start of the arena, and every free block stores
//! the offset of its bucket successor in its first payload word. `NIL` (the
//! zero offset, where the sentinel table itself lives) terminates a list.
//!
//! Buckets are power-of-two size classes. Within a bucket the list is kept
//! in ascending size order, so taking the first block that fits approximates
//! a best fit at linear-scan cost.

use arena::{Arena, WORD};

use crate::{BUCKET_COUNT, MIN_BLOCK, SEARCH_CEILING, tag};

/// List terminator. No block payload can sit at offset zero, which is the
/// first sentinel slot.
pub(crate) const NIL: usize = 0;

/// Offset of the sentinel word for `bucket`.
fn sentinel(bucket: usize) -> usize {
    bucket * WORD
}

/// Reads the successor link stored at `p`, which may be a sentinel slot or a
/// free block's payload offset.
pub(crate) fn successor(arena: &Arena, p: usize) -> usize {
    arena.word(p)
}

fn set_successor(arena: &mut Arena, p: usize, next: usize) {
    arena.set_word(p, next);
}

/// Maps a block size to its bucket.
///
/// Bucket `i` holds sizes in `[MIN_BLOCK << i, MIN_BLOCK << (i + 1))`;
/// everything at or above [`SEARCH_CEILING`] lands in the last bucket. The
/// classification halves the scaled size rather than consulting a table.
pub(crate) fn bucket_for(size: usize) -> usize {
    if size >= SEARCH_CEILING {
        return BUCKET_COUNT - 1;
    }
    let mut bucket = 0;
    let mut scaled = size >> MIN_BLOCK.trailing_zeros();
    while scaled > 1 {
        scaled >>= 1;
        bucket += 1;
    }
    bucket
}

/// Inserts the free block at `bp` into its bucket, keeping the list in
/// ascending size order.
pub(crate) fn insert(arena: &mut Arena, bp: usize) {
    let size = tag::load(arena, bp).size();
    let mut prev = sentinel(bucket_for(size));
    let mut next = successor(arena, prev);
    while next != NIL && tag::load(arena, next).size() < size {
        prev = next;
        next = successor(arena, next);
    }
    set_successor(arena, bp, next);
    set_successor(arena, prev, bp);
}

/// Unlinks the free block at `bp` from its bucket.
///
/// The list only carries successor links, so removal rescans the bucket from
/// its sentinel. Cost is linear in the bucket length.
///
/// # Panics
///
/// Panics if `bp` is not on the list its size assigns it to.
pub(crate) fn remove(arena: &mut Arena, bp: usize) {
    let mut prev = sentinel(bucket_for(tag::load(arena, bp).size()));
    let mut current = successor(arena, prev);
    while current != NIL && current != bp {
        prev = current;
        current = successor(arena, current);
    }
    assert!(current == bp, "free block missing from its bucket");
    let next = successor(arena, bp);
    set_successor(arena, prev, next);
}

/// Finds a free block of at least `size` bytes.
///
/// Scans the matching bucket first. If nothing there fits, the head of the
/// first non-empty larger bucket is taken as is: every block in a strictly
/// larger bucket already exceeds any size that classifies below it.
pub(crate) fn find_fit(arena: &Arena, size: usize) -> Option<usize> {
    let first = bucket_for(size);

    let mut p = successor(arena, sentinel(first));
    while p != NIL {
        if tag::load(arena, p).size() >= size {
            return Some(p);
        }
        p = successor(arena, p);
    }

    for bucket in first + 1..BUCKET_COUNT {
        let head = successor(arena, sentinel(bucket));
        if head != NIL {
            return Some(head);
        }
    }

    None
}

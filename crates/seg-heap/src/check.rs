//! Heap-consistency checker.
//!
//! The checker cross-validates the two views the allocator keeps of the same
//! memory: the segregated free lists and the address-ordered block chain.
//! It never mutates the heap and never panics on corrupt metadata; every
//! broken invariant becomes a [`Violation`] in the returned report, and a
//! walk that can no longer be trusted is abandoned rather than followed out
//! of bounds.

use alloc::{string::String, vec::Vec};
use core::fmt;

use arena::WORD;
use snafu::Snafu;

use crate::{ALIGNMENT, BASE, BUCKET_COUNT, MIN_BLOCK, PROLOGUE, heap::Heap, index, tag};

/// One broken heap invariant, located by payload offset.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum Violation {
    /// The prologue marker lies outside the arena.
    #[snafu(display("prologue marker lies outside the arena"))]
    PrologueOutOfBounds,

    /// The prologue marker is not flagged allocated.
    #[snafu(display("prologue marker is not allocated"))]
    PrologueNotAllocated,

    /// The prologue marker's size field changed.
    #[snafu(display("prologue marker has size {size} instead of {expected}", expected = 2 * WORD))]
    PrologueSize { size: usize },

    /// The epilogue marker is not at the arena end.
    #[snafu(display("epilogue marker at offset {found:#x} instead of arena end {expected:#x}"))]
    EpiloguePosition { found: usize, expected: usize },

    /// The epilogue marker sits at a misaligned offset.
    #[snafu(display("epilogue marker offset {offset:#x} is misaligned"))]
    EpilogueMisaligned { offset: usize },

    /// The epilogue marker is not flagged allocated.
    #[snafu(display("epilogue marker is not allocated"))]
    EpilogueNotAllocated,

    /// The epilogue marker's size field is not zero.
    #[snafu(display("epilogue marker has nonzero size {size}"))]
    EpilogueSize { size: usize },

    /// A free-list successor link points outside the data-block region.
    #[snafu(display("free list of bucket {bucket} reaches offset {offset:#x} outside the heap"))]
    ListOutOfBounds { bucket: usize, offset: usize },

    /// A block sits at an offset that is not a multiple of the alignment
    /// unit.
    #[snafu(display("block at offset {offset:#x} is misaligned"))]
    Misaligned { offset: usize },

    /// A block on a free list has its allocated bit set.
    #[snafu(display("block at offset {offset:#x} is on a free list but marked allocated"))]
    ListBlockAllocated { offset: usize },

    /// A block is smaller than the minimum block size.
    #[snafu(display("block at offset {offset:#x} has size {size}, below the minimum"))]
    Undersized { offset: usize, size: usize },

    /// A free block's footer does not mirror its header.
    #[snafu(display(
        "block at offset {offset:#x} has header {header:#x} but footer {footer:#x}"
    ))]
    FooterMismatch {
        offset: usize,
        header: usize,
        footer: usize,
    },

    /// A free block is linked into a bucket its size does not map to.
    #[snafu(display(
        "block of size {size} at offset {offset:#x} sits in bucket {found} instead of {expected}"
    ))]
    WrongBucket {
        offset: usize,
        size: usize,
        found: usize,
        expected: usize,
    },

    /// The address-ordered walk left the arena.
    #[snafu(display("address-ordered walk reaches offset {offset:#x} outside the arena"))]
    ChainOutOfBounds { offset: usize },

    /// Two address-adjacent blocks are both free.
    #[snafu(display("free block at offset {offset:#x} has a free successor; coalescing missed"))]
    Uncoalesced { offset: usize },

    /// A block's allocated bit disagrees with its successor's
    /// prev-allocated bit.
    #[snafu(display(
        "block at offset {offset:#x} disagrees with its successor's prev-allocated bit"
    ))]
    PrevAllocatedMismatch { offset: usize },

    /// The bucket walk and the chain walk found different numbers of free
    /// blocks.
    #[snafu(display(
        "free block counts disagree: {list_total} via buckets, {chain_total} via the chain"
    ))]
    FreeCountMismatch {
        list_total: usize,
        chain_total: usize,
    },

    /// The address-ordered walk did not terminate at the epilogue.
    #[snafu(display(
        "address-ordered walk ended at offset {offset:#x}, not at the epilogue {epilogue:#x}"
    ))]
    WalkEnd { offset: usize, epilogue: usize },
}

/// Outcome of one [`Heap::check_consistency`] call.
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    context: String,
    violations: Vec<Violation>,
}

impl ConsistencyReport {
    /// The caller-supplied tag identifying the call site.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Every invariant violation found, in discovery order.
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Returns `true` if no violations were found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "heap check ({}): consistent", self.context);
        }
        writeln!(
            f,
            "heap check ({}): {} violations",
            self.context,
            self.violations.len()
        )?;
        for violation in &self.violations {
            writeln!(f, "  - {violation}")?;
        }
        Ok(())
    }
}

pub(crate) fn run(heap: &Heap, context: &str) -> ConsistencyReport {
    let mut violations = Vec::new();

    check_prologue(heap, &mut violations);
    check_epilogue(heap, &mut violations);
    let list_total = walk_buckets(heap, &mut violations);
    let chain_total = walk_chain(heap, &mut violations);
    if list_total != chain_total {
        violations.push(Violation::FreeCountMismatch {
            list_total,
            chain_total,
        });
    }

    ConsistencyReport {
        context: String::from(context),
        violations,
    }
}

fn check_prologue(heap: &Heap, out: &mut Vec<Violation>) {
    if PROLOGUE > heap.arena.len() {
        out.push(Violation::PrologueOutOfBounds);
        return;
    }
    let tag = tag::load(&heap.arena, PROLOGUE);
    if !tag.is_allocated() {
        out.push(Violation::PrologueNotAllocated);
    }
    if tag.size() != 2 * WORD {
        out.push(Violation::PrologueSize { size: tag.size() });
    }
}

fn check_epilogue(heap: &Heap, out: &mut Vec<Violation>) {
    if heap.epilogue != heap.arena.len() {
        out.push(Violation::EpiloguePosition {
            found: heap.epilogue,
            expected: heap.arena.len(),
        });
    }
    if !heap.epilogue.is_multiple_of(ALIGNMENT) {
        out.push(Violation::EpilogueMisaligned {
            offset: heap.epilogue,
        });
    }
    if heap.epilogue >= BASE && heap.epilogue <= heap.arena.len() {
        let tag = tag::load(&heap.arena, heap.epilogue);
        if !tag.is_allocated() {
            out.push(Violation::EpilogueNotAllocated);
        }
        if tag.size() != 0 {
            out.push(Violation::EpilogueSize { size: tag.size() });
        }
    }
}

/// Walks every bucket's free list and returns the number of blocks seen.
///
/// Each block must be free, in bounds, aligned, at least the minimum size,
/// footer-consistent, and filed in the bucket its size maps to. A list whose
/// next link cannot be trusted is abandoned; a step budget bounds the walk
/// even if corrupt links form a cycle.
fn walk_buckets(heap: &Heap, out: &mut Vec<Violation>) -> usize {
    let mut total = 0;
    for bucket in 0..BUCKET_COUNT {
        let mut budget = heap.arena.len() / MIN_BLOCK + 1;
        let mut p = index::successor(&heap.arena, bucket * WORD);
        while p != index::NIL && budget > 0 {
            budget -= 1;
            if p < BASE || p >= heap.arena.len() {
                out.push(Violation::ListOutOfBounds { bucket, offset: p });
                break;
            }
            if !p.is_multiple_of(ALIGNMENT) {
                out.push(Violation::Misaligned { offset: p });
                break;
            }
            total += 1;

            let tag = tag::load(&heap.arena, p);
            if tag.is_allocated() {
                out.push(Violation::ListBlockAllocated { offset: p });
            }
            let size = tag.size();
            if size < MIN_BLOCK {
                out.push(Violation::Undersized { offset: p, size });
            } else if p + size > heap.arena.len() {
                out.push(Violation::ListOutOfBounds {
                    bucket,
                    offset: p + size,
                });
            } else {
                let footer = tag::load_footer(&heap.arena, p);
                if !tag.agrees_with(footer) {
                    out.push(Violation::FooterMismatch {
                        offset: p,
                        header: tag.word(),
                        footer: footer.word(),
                    });
                }
            }
            let expected = index::bucket_for(size);
            if expected != bucket {
                out.push(Violation::WrongBucket {
                    offset: p,
                    size,
                    found: bucket,
                    expected,
                });
            }

            p = index::successor(&heap.arena, p);
        }
    }
    total
}

/// Walks the block chain from the first data block to the epilogue and
/// returns the number of free blocks seen.
fn walk_chain(heap: &Heap, out: &mut Vec<Violation>) -> usize {
    let mut total = 0;
    let mut bp = BASE;
    loop {
        if bp > heap.arena.len() {
            out.push(Violation::ChainOutOfBounds { offset: bp });
            break;
        }
        if !bp.is_multiple_of(ALIGNMENT) {
            out.push(Violation::Misaligned { offset: bp });
            break;
        }
        let tag = tag::load(&heap.arena, bp);
        if tag.size() == 0 {
            break;
        }

        let next = bp + tag.size();
        if next > heap.arena.len() {
            out.push(Violation::ChainOutOfBounds { offset: next });
            bp = next;
            break;
        }
        let next_tag = tag::load(&heap.arena, next);
        if !tag.is_allocated() {
            total += 1;
            if !next_tag.is_allocated() {
                out.push(Violation::Uncoalesced { offset: bp });
            }
        }
        if tag.is_allocated() != next_tag.prev_allocated() {
            out.push(Violation::PrevAllocatedMismatch { offset: bp });
        }

        bp = next;
    }
    if bp != heap.epilogue {
        out.push(Violation::WalkEnd {
            offset: bp,
            epilogue: heap.epilogue,
        });
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Heap,
        tag::{BlockTag, store, store_footer},
    };

    /// Heap with one isolated free block, pinned by an allocated neighbor so
    /// it cannot merge away.
    fn heap_with_free_block() -> (Heap, usize) {
        let mut heap = Heap::new().unwrap();
        let a = heap.allocate(64).unwrap();
        let _pin = heap.allocate(64).unwrap();
        heap.deallocate(Some(a));
        (heap, a.offset())
    }

    fn has<F>(report: &ConsistencyReport, predicate: F) -> bool
    where
        F: Fn(&Violation) -> bool,
    {
        report.violations().iter().any(predicate)
    }

    #[test]
    fn clean_heap_has_no_violations() {
        let (heap, _) = heap_with_free_block();
        let report = heap.check_consistency("clean heap");
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.context(), "clean heap");
    }

    #[test]
    fn display_covers_context_and_violations() {
        let (mut heap, bp) = heap_with_free_block();
        assert_eq!(
            heap.check_consistency("tag").to_string(),
            "heap check (tag): consistent"
        );

        let tag = tag::load(&heap.arena, bp).with_allocated(true);
        store(&mut heap.arena, bp, tag);
        let rendered = heap.check_consistency("corrupted").to_string();
        assert!(rendered.contains("heap check (corrupted)"), "{rendered}");
        assert!(rendered.contains("marked allocated"), "{rendered}");
    }

    #[test]
    fn allocated_block_on_free_list_is_reported() {
        let (mut heap, bp) = heap_with_free_block();
        let tag = tag::load(&heap.arena, bp).with_allocated(true);
        store(&mut heap.arena, bp, tag);

        let report = heap.check_consistency("allocated bit set on listed block");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::ListBlockAllocated { offset } if *offset == bp
        )));
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::FreeCountMismatch { .. }
        )));
    }

    #[test]
    fn footer_disagreement_is_reported() {
        let (mut heap, bp) = heap_with_free_block();
        let size = tag::load(&heap.arena, bp).size();
        let bogus = BlockTag::new(size + ALIGNMENT, true, false);
        heap.arena.set_word(bp + size - 2 * WORD, bogus.word());

        let report = heap.check_consistency("footer size flipped");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::FooterMismatch { offset, .. } if *offset == bp
        )));
    }

    #[test]
    fn wrong_bucket_is_reported() {
        let (mut heap, bp) = heap_with_free_block();
        let size = tag::load(&heap.arena, bp).size();
        let expected = index::bucket_for(size);
        let wrong = expected + 3;

        index::remove(&mut heap.arena, bp);
        heap.arena.set_word(wrong * WORD, bp);
        heap.arena.set_word(bp, index::NIL);

        let report = heap.check_consistency("block filed in the wrong bucket");
        assert!(has(&report, |violation| matches!(
            *violation,
            Violation::WrongBucket { offset, found, expected: e, .. }
                if offset == bp && found == wrong && e == expected
        )));
    }

    #[test]
    fn missed_coalescing_is_reported() {
        let (mut heap, bp) = heap_with_free_block();
        let size = tag::load(&heap.arena, bp).size();
        assert!(size >= 2 * MIN_BLOCK);

        // Split the free block into two adjacent free blocks by hand,
        // keeping every other invariant intact.
        index::remove(&mut heap.arena, bp);
        let first = BlockTag::new(MIN_BLOCK, true, false);
        store(&mut heap.arena, bp, first);
        store_footer(&mut heap.arena, bp, first);
        let second = BlockTag::new(size - MIN_BLOCK, false, false);
        store(&mut heap.arena, bp + MIN_BLOCK, second);
        store_footer(&mut heap.arena, bp + MIN_BLOCK, second);
        index::insert(&mut heap.arena, bp);
        index::insert(&mut heap.arena, bp + MIN_BLOCK);

        let report = heap.check_consistency("adjacent free blocks");
        assert_eq!(
            report.violations(),
            &[Violation::Uncoalesced { offset: bp }],
            "{report}"
        );
    }

    #[test]
    fn prev_allocated_disagreement_is_reported() {
        let (mut heap, bp) = heap_with_free_block();
        let next = tag::next_block(&heap.arena, bp);
        let lying = tag::load(&heap.arena, next).with_prev_allocated(true);
        store(&mut heap.arena, next, lying);

        let report = heap.check_consistency("stale prev-allocated bit");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::PrevAllocatedMismatch { offset } if *offset == bp
        )));
    }

    #[test]
    fn severed_bucket_list_breaks_the_count() {
        let (mut heap, bp) = heap_with_free_block();
        let bucket = index::bucket_for(tag::load(&heap.arena, bp).size());
        heap.arena.set_word(bucket * WORD, index::NIL);

        let report = heap.check_consistency("orphaned free block");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::FreeCountMismatch { list_total, chain_total }
                if *chain_total == *list_total + 1
        )));
    }

    #[test]
    fn prologue_corruption_is_reported() {
        let (mut heap, _) = heap_with_free_block();
        heap.arena.set_word(
            crate::PROLOGUE_HEADER,
            BlockTag::new(4 * WORD, true, false).word(),
        );

        let report = heap.check_consistency("prologue rewritten");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::PrologueNotAllocated
        )));
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::PrologueSize { size } if *size == 4 * WORD
        )));
    }

    #[test]
    fn epilogue_corruption_is_reported() {
        let (mut heap, _) = heap_with_free_block();
        let header = tag::header(heap.epilogue);
        heap.arena.set_word(header, BlockTag::new(0, false, false).word());

        let report = heap.check_consistency("epilogue freed");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::EpilogueNotAllocated
        )));
    }

    #[test]
    fn displaced_epilogue_is_reported() {
        let (mut heap, _) = heap_with_free_block();
        heap.epilogue += ALIGNMENT;

        let report = heap.check_consistency("epilogue cursor drifted");
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::EpiloguePosition { .. }
        )));
        assert!(has(&report, |violation| matches!(
            violation,
            Violation::WalkEnd { .. }
        )));
    }
}

//! Segregated-fit heap allocator with boundary-tag coalescing.
//!
//! This crate implements a dynamic memory allocator over a single growable
//! [`Arena`](arena::Arena). Blocks are identified by byte offsets into the
//! arena rather than pointers, which keeps every access bounds-checked and
//! the whole allocator in safe code.
//!
//! # Algorithm
//!
//! - **Segregated free lists**: free blocks are grouped into
//!   [`BUCKET_COUNT`] power-of-two size classes. Each bucket is a
//!   singly-linked list kept in ascending size order, so the first fit found
//!   in a bucket approximates the best fit.
//! - **Boundary tags**: every block starts with a one-word header encoding
//!   its size, its own allocation bit, and the allocation bit of the block
//!   before it in address order. Free blocks mirror the header in a trailing
//!   footer; allocated blocks omit the footer entirely, so the
//!   prev-allocated bit is what lets [`Heap::deallocate`] decide whether a
//!   backward merge is possible without touching a neighbor's payload.
//! - **Immediate coalescing**: freed blocks are merged with free neighbors
//!   on the spot, so no two adjacent blocks are ever both free.
//! - **Chunked growth**: when no free block fits, the arena grows by at
//!   least [`CHUNK_SIZE`] bytes and the new space is merged with a trailing
//!   free block if there is one.
//!
//! # Arena layout
//!
//! ```text
//! ┌───────────────┬─────┬──────────┬─────────────────────────┬──────────┐
//! │ bucket heads  │ pad │ prologue │ data blocks ...         │ epilogue │
//! └───────────────┴─────┴──────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The prologue and epilogue are zero-payload allocated markers bounding the
//! block chain; the epilogue is relocated every time the arena grows.
//!
//! # Examples
//!
//! ```
//! use seg_heap::Heap;
//!
//! let mut heap = Heap::new().unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! heap.payload_mut(ptr)[..5].copy_from_slice(b"hello");
//! assert_eq!(&heap.payload(ptr)[..5], b"hello");
//!
//! let report = heap.check_consistency("after first allocation");
//! assert!(report.is_clean());
//!
//! heap.deallocate(Some(ptr));
//! ```
//!
//! # Thread safety
//!
//! A [`Heap`] is a single-owner structure. All operations take `&mut self`,
//! so the borrow checker enforces the single-threaded, non-reentrant use the
//! allocator is designed for.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use arena::WORD;

pub use self::{
    check::{ConsistencyReport, Violation},
    heap::{BlockPtr, Heap, HeapError},
};

mod check;
mod heap;
mod index;
mod tag;

/// Alignment unit for block sizes and payload offsets, two words.
pub const ALIGNMENT: usize = 2 * WORD;

/// Smallest representable block: header, successor word, and footer, rounded
/// up to the alignment unit.
pub const MIN_BLOCK: usize = 2 * ALIGNMENT;

/// Number of segregated free-list buckets.
pub const BUCKET_COUNT: usize = 9;

/// Sizes at or above this ceiling all fall into the last bucket.
pub const SEARCH_CEILING: usize = MIN_BLOCK << (BUCKET_COUNT - 1);

/// Minimum number of bytes the arena grows by when the free lists are
/// exhausted.
pub const CHUNK_SIZE: usize = 4096;

/// Bytes of free space set up when a heap is created, before any request.
pub const INITIAL_EXTEND: usize = 1 << 14;

/// Byte size of the bucket sentinel table at the start of the arena.
pub(crate) const SENTINEL_TABLE: usize = BUCKET_COUNT * WORD;

/// Offset of the prologue header. One padding word follows the sentinel
/// table so that payload offsets land on [`ALIGNMENT`] boundaries.
pub(crate) const PROLOGUE_HEADER: usize = SENTINEL_TABLE + WORD;

/// Payload offset of the prologue marker.
pub(crate) const PROLOGUE: usize = PROLOGUE_HEADER + WORD;

/// Payload offset of the first data block, and of the epilogue while the
/// heap is still empty.
pub(crate) const BASE: usize = PROLOGUE_HEADER + 2 * WORD;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_BLOCK % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE % ALIGNMENT == 0);
const _: () = assert!(INITIAL_EXTEND % ALIGNMENT == 0);
const _: () = assert!(BASE % ALIGNMENT == 0);
const _: () = assert!(SEARCH_CEILING == 1 << 13);

//! # brkalloc - A First-Fit Heap Allocator on the Program Break
//!
//! This crate provides a **first-fit, coalescing heap allocator** that manages
//! a contiguous arena grown with the `sbrk` system call (or any other region
//! that only grows at its high end).
//!
//! ## Overview
//!
//! The arena is tiled, without gaps, by blocks that are either allocated or
//! free. Each block starts with a header; the body follows it.
//!
//! ```text
//!   Arena Layout:
//!
//!   heap_start                                                program_break
//!   │                                                                     │
//!   ▼                                                                     ▼
//!   ┌─────────┬───────────┬─────────┬─────────┬───────────┬───────────────┐
//!   │  alloc  │   free    │  alloc  │  alloc  │   free    │     alloc     │
//!   └─────────┴───────────┴─────────┴─────────┴───────────┴───────────────┘
//!                 ▲  │                            ▲  │
//!                 │  └──────── next_free ─────────┘  │
//!   free_block_list          ◄──── prev_free ────────┘
//! ```
//!
//! - Free blocks form an address-ordered, doubly linked **free list**.
//! - No two free blocks are ever adjacent: freeing always coalesces.
//! - Every block records what sits directly behind and ahead of it, so the
//!   merge decision on free is O(1).
//!
//! ## Crate Structure
//!
//! ```text
//!   brkalloc
//!   ├── arena    - Arena: allocate / deallocate
//!   ├── block    - Header encoding, BlockRef and Handle offsets
//!   ├── brk      - ProgramBreak trait, Sbrk and FixedRegion
//!   ├── error    - Exhaustion errors
//!   └── inspect  - Block walks, integrity checks, heap dump
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use brkalloc::Arena;
//!
//! let mut arena = Arena::with_capacity(4096);
//!
//! let handle = arena.allocate(8).unwrap();
//! arena.body_mut(handle).copy_from_slice(&42u64.to_le_bytes());
//! assert_eq!(arena.body(handle), &42u64.to_le_bytes());
//!
//! arena.deallocate(Some(handle));
//! ```
//!
//! On the real program break:
//!
//! ```rust,ignore
//! use brkalloc::{Arena, Sbrk};
//!
//! let mut arena = Arena::new(unsafe { Sbrk::new() });
//! let handle = arena.allocate(64)?;
//! ```
//!
//! ## How It Works
//!
//! Every header is six 64-bit words. Allocated and free headers have the same
//! size, so a block changes kind without moving its body:
//!
//! ```text
//!   Allocated block                    Free block
//!   ┌──────────────────────┐           ┌──────────────────────┐
//!   │ tag: ALLOCATED       │           │ tag: FREE            │
//!   │ length               │           │ length               │
//!   │ back_merge  (free)   │           │ prev_free            │
//!   │ fwd_merge   (free)   │           │ next_free            │
//!   │ prev_alloc  (alloc)  │           │ back_cand   (alloc)  │
//!   │ next_alloc  (alloc)  │           │ fwd_cand    (alloc)  │
//!   ├──────────────────────┤           ├──────────────────────┤
//!   │ body ...             │           │ body ...             │
//!   └──────────────────────┘           └──────────────────────┘
//!     ▲
//!     └── Handle returned to the caller
//! ```
//!
//! Allocation takes the **first** free block that fits. If what is left over
//! can still form a block, the allocation is carved out of its high end;
//! otherwise the whole free block is handed out. When nothing fits and the
//! last block of the arena is free, only the missing bytes are requested from
//! the program break.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: wrap the arena in a lock to share it
//! - **Never shrinks**: freed memory is recycled, not returned to the OS
//! - **No alignment**: bodies start right after 48-byte headers
//!
//! ## Safety
//!
//! The allocator itself is safe code over the byte region its
//! [`ProgramBreak`] exposes. Only [`Sbrk`] touches the process break, and
//! creating one is `unsafe`.

mod arena;
mod block;
mod brk;
mod error;
mod inspect;

pub use arena::Arena;
pub use block::{
  ALLOC_HEADER_SIZE, BlockRef, FREE_HEADER_SIZE, Handle, MIN_BLOCK_SIZE, MIN_BODY_SIZE, WORD,
};
#[cfg(unix)]
pub use brk::Sbrk;
pub use brk::{FixedRegion, ProgramBreak};
pub use error::{Error, Result};
pub use inspect::{BlockInfo, BlockKind, Blocks, FreeBlocks};

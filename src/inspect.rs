use std::fmt;

use crate::arena::Arena;
use crate::block::{BlockRef, Handle, Header};
use crate::brk::ProgramBreak;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
  Allocated,
  Free,
}

/// A block as seen from outside the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Header offset from `heap_start`.
  pub offset: usize,
  pub kind: BlockKind,
  /// Body length.
  pub length: usize,
  footprint: usize,
}

impl BlockInfo {
  fn new(
    at: BlockRef,
    header: &Header,
  ) -> Self {
    let kind = match header {
      Header::Allocated(_) => BlockKind::Allocated,
      Header::Free(_) => BlockKind::Free,
    };
    Self {
      offset: at.offset(),
      kind,
      length: header.length(),
      footprint: header.footprint(),
    }
  }

  /// Header plus body.
  pub fn footprint(&self) -> usize {
    self.footprint
  }

  /// Handle of the body, for allocated blocks.
  pub fn handle(&self) -> Option<Handle> {
    match self.kind {
      BlockKind::Allocated => Some(BlockRef(self.offset).body()),
      BlockKind::Free => None,
    }
  }
}

/// Address-ordered walk over every block of an arena.
pub struct Blocks<'a, B: ProgramBreak> {
  arena: &'a Arena<B>,
  cursor: usize,
}

impl<B: ProgramBreak> Iterator for Blocks<'_, B> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    if self.cursor >= self.arena.program_break() {
      return None;
    }
    let at = BlockRef(self.cursor);
    let info = BlockInfo::new(at, &self.arena.read(at));
    self.cursor += info.footprint;
    Some(info)
  }
}

/// Walk along the free list, lowest address first.
pub struct FreeBlocks<'a, B: ProgramBreak> {
  arena: &'a Arena<B>,
  cursor: Option<BlockRef>,
}

impl<B: ProgramBreak> Iterator for FreeBlocks<'_, B> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let at = self.cursor?;
    let header = self.arena.free_header(at);
    self.cursor = header.next_free;
    Some(BlockInfo::new(at, &Header::Free(header)))
  }
}

impl<B: ProgramBreak> Arena<B> {
  pub fn blocks(&self) -> Blocks<'_, B> {
    Blocks { arena: self, cursor: 0 }
  }

  pub fn free_blocks(&self) -> FreeBlocks<'_, B> {
    FreeBlocks {
      arena: self,
      cursor: self.free_block_list,
    }
  }

  /// Asserts that the arena is consistent:
  ///
  /// 1. Blocks tile `[heap_start, program_break)` exactly.
  ///
  /// 2. No two free blocks are adjacent.
  ///
  /// 3. Every relation a block records names the block actually next to it,
  ///    and only when that block has the matching kind.
  ///
  /// 4. The free list visits every free block once, in address order.
  ///
  /// 5. `last_alloc_block` and the free list head are the highest allocated
  ///    and lowest free block.
  ///
  /// # Panics
  ///
  /// On the first violation found.
  pub fn check_integrity(&self) {
    let program_break = self.program_break();
    let block_at = |offset: usize| {
      (offset < program_break).then(|| {
        let at = BlockRef(offset);
        (at, self.read(at))
      })
    };
    let kind_of = |neighbor: Option<(BlockRef, Header)>, free: bool| {
      neighbor
        .filter(|(_, header)| matches!(header, Header::Free(_)) == free)
        .map(|(at, _)| at)
    };

    // A single pass in address order, with the free list followed in
    // lockstep. Runs after every operation, so it must stay off the heap.
    let mut behind = None;
    let mut current = block_at(0);
    let mut listed = self.free_block_list;
    let mut prev_free = None;
    let mut last_alloc = None;

    while let Some((at, header)) = current {
      let end = at.offset() + header.footprint();
      // (1)
      assert!(end <= program_break, "block {at} overruns the program break");
      let ahead = block_at(end);

      match header {
        Header::Allocated(alloc) => {
          // (3)
          assert_eq!(alloc.back_merge, kind_of(behind, true), "back merge of {at}");
          assert_eq!(alloc.fwd_merge, kind_of(ahead, true), "forward merge of {at}");
          assert_eq!(
            alloc.prev_alloc,
            kind_of(behind, false),
            "previous allocated of {at}"
          );
          assert_eq!(alloc.next_alloc, kind_of(ahead, false), "next allocated of {at}");
          last_alloc = Some(at);
        }
        Header::Free(free) => {
          // (2)
          assert!(
            kind_of(ahead, true).is_none(),
            "free blocks {at} and its successor are adjacent"
          );
          // (3)
          assert_eq!(free.back_cand, kind_of(behind, false), "back candidate of {at}");
          assert_eq!(free.fwd_cand, kind_of(ahead, false), "forward candidate of {at}");
          // (4) and the head half of (5)
          assert_eq!(listed, Some(at), "free list out of address order at {at}");
          assert_eq!(free.prev_free, prev_free, "previous free of {at}");
          prev_free = Some(at);
          listed = free.next_free;
        }
      }

      behind = current;
      current = ahead;
    }

    // (4)
    assert_eq!(listed, None, "free list longer than the free blocks");
    // (5)
    assert_eq!(self.last_alloc_block, last_alloc, "last allocated block");
  }
}

impl<B: ProgramBreak> fmt::Display for Arena<B> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let link =
      |block: Option<BlockRef>| block.map_or_else(|| "null".to_string(), |at| at.to_string());

    writeln!(f, "heap_start=0x0")?;
    writeln!(f, "program_break={:#x}", self.program_break())?;
    writeln!(f, "free_block_list={}", link(self.free_block_list))?;
    writeln!(f, "last_alloc_block={}", link(self.last_alloc_block))?;
    for info in self.blocks() {
      let kind = match info.kind {
        BlockKind::Allocated => "alloc",
        BlockKind::Free => "free ",
      };
      writeln!(f, "  {:#08x} {kind} length={}", info.offset, info.length)?;
    }
    Ok(())
  }
}

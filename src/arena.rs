use crate::block::{
  ALLOC_HEADER_SIZE, AllocHeader, BlockRef, FREE_HEADER_SIZE, FreeHeader, Handle, Header,
  MIN_BLOCK_SIZE, MIN_BODY_SIZE,
};
use crate::brk::{FixedRegion, ProgramBreak};
use crate::error::{Error, Result};

/// First-fit allocator over a region that only grows at its high end.
///
/// Every block carries its relations to the blocks directly around it, so
/// deciding how a freed block coalesces is O(1). Only the first-fit search and
/// the free-list insertion of an isolated block walk.
pub struct Arena<B: ProgramBreak> {
  pub(crate) brk: B,
  /// Lowest-addressed free block.
  pub(crate) free_block_list: Option<BlockRef>,
  /// Highest-addressed allocated block.
  pub(crate) last_alloc_block: Option<BlockRef>,
}

enum FirstFit {
  /// Free block large enough for the request.
  Found(BlockRef, FreeHeader),
  /// Nothing fits; carries the highest free block.
  Missing(BlockRef, FreeHeader),
}

impl Arena<FixedRegion> {
  pub fn with_capacity(capacity: usize) -> Self {
    Self::new(FixedRegion::new(capacity))
  }
}

impl<B: ProgramBreak> Arena<B> {
  /// Builds an arena on an empty region. `heap_start` is the region's current
  /// start.
  pub fn new(brk: B) -> Self {
    debug_assert!(brk.memory().is_empty(), "arena must start on an empty region");
    Self {
      brk,
      free_block_list: None,
      last_alloc_block: None,
    }
  }

  /// Offset of the high-water mark from `heap_start`.
  pub fn program_break(&self) -> usize {
    self.brk.memory().len()
  }

  pub fn growth(&self) -> &B {
    &self.brk
  }

  pub fn free_list_head(&self) -> Option<BlockRef> {
    self.free_block_list
  }

  pub fn last_alloc_block(&self) -> Option<Handle> {
    self.last_alloc_block.map(BlockRef::body)
  }

  /// Usable bytes behind `handle`. May exceed the requested size when a free
  /// block was handed out whole.
  pub fn block_len(
    &self,
    handle: Handle,
  ) -> usize {
    self.alloc_header(handle.block()).length
  }

  pub fn body(
    &self,
    handle: Handle,
  ) -> &[u8] {
    let length = self.block_len(handle);
    &self.brk.memory()[handle.0..handle.0 + length]
  }

  pub fn body_mut(
    &mut self,
    handle: Handle,
  ) -> &mut [u8] {
    let length = self.block_len(handle);
    &mut self.brk.memory_mut()[handle.0..handle.0 + length]
  }

  pub fn as_ptr(
    &self,
    handle: Handle,
  ) -> *const u8 {
    self.brk.memory()[handle.0..].as_ptr()
  }

  /// Allocates a block with at least `size` body bytes.
  ///
  /// `size == 0` still yields a distinct block. The arena grows only by what
  /// the request cannot take from free blocks; if growth fails nothing
  /// changes and the primitive's error is returned.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<Handle> {
    log::trace!("Arena::allocate({size})");

    let size = size.max(MIN_BODY_SIZE);
    let real_size = ALLOC_HEADER_SIZE
      .checked_add(size)
      .ok_or(Error::Exhausted {
        requested: size.saturating_add(ALLOC_HEADER_SIZE),
      })?;

    let block = match self.free_block_list {
      None => self.push_block(size, real_size)?,
      Some(head) => match self.first_fit(head, real_size) {
        FirstFit::Missing(at, free) => self.grow_into_tail(at, free, size, real_size)?,
        FirstFit::Found(at, free)
          if FREE_HEADER_SIZE + free.length - real_size >= MIN_BLOCK_SIZE =>
        {
          self.split(at, free, size, real_size)
        }
        FirstFit::Found(at, free) => self.take_whole(at, free),
      },
    };

    #[cfg(debug_assertions)]
    self.check_integrity();

    let handle = block.body();
    log::trace!("Arena::allocate({size}) -> {handle}");
    Ok(handle)
  }

  /// Returns a block to the arena. `None` is a no-op.
  ///
  /// # Panics
  ///
  /// If `handle` does not name a live allocated block. Debug builds also catch
  /// most double frees this way.
  pub fn deallocate(
    &mut self,
    handle: Option<Handle>,
  ) {
    let Some(handle) = handle else {
      return;
    };
    log::trace!("Arena::deallocate({handle})");

    let at = handle.block();
    let header = self.alloc_header(at);

    if self.last_alloc_block == Some(at) {
      self.last_alloc_block = header
        .prev_alloc
        .or_else(|| header.back_merge.and_then(|back| self.free_header(back).back_cand));
    }

    match (header.back_merge, header.fwd_merge) {
      (Some(back), Some(fwd)) => self.merge_both(at, header, back, fwd),
      (Some(back), None) => self.merge_back(at, header, back),
      (None, Some(fwd)) => self.merge_fwd(at, header, fwd),
      (None, None) => self.release_isolated(at, header),
    }

    #[cfg(debug_assertions)]
    self.check_integrity();
  }

  fn first_fit(
    &self,
    head: BlockRef,
    real_size: usize,
  ) -> FirstFit {
    let mut at = head;
    loop {
      let free = self.free_header(at);
      if FREE_HEADER_SIZE + free.length >= real_size {
        return FirstFit::Found(at, free);
      }
      match free.next_free {
        Some(next) => at = next,
        None => return FirstFit::Missing(at, free),
      }
    }
  }

  /// Moves the break and returns where the new bytes start.
  fn grow(
    &mut self,
    increment: usize,
  ) -> Result<BlockRef> {
    let at = BlockRef(self.program_break());
    self.brk.extend(increment)?;
    log::debug!(
      "Arena::grow({increment}) program_break = {:#x}",
      self.program_break()
    );
    Ok(at)
  }

  /// No free blocks at all: the new block goes at the break.
  fn push_block(
    &mut self,
    size: usize,
    real_size: usize,
  ) -> Result<BlockRef> {
    let at = self.grow(real_size)?;
    self.write_alloc(
      at,
      AllocHeader {
        length: size,
        back_merge: None,
        fwd_merge: None,
        prev_alloc: self.last_alloc_block,
        next_alloc: None,
      },
    );

    if let Some(last) = self.last_alloc_block {
      self.update_alloc(last, |header| header.next_alloc = Some(at));
    }
    self.last_alloc_block = Some(at);
    Ok(at)
  }

  /// Nothing fits. A free tail is absorbed so only the shortfall is requested;
  /// otherwise the whole block is placed at the break.
  fn grow_into_tail(
    &mut self,
    last_free: BlockRef,
    free: FreeHeader,
    size: usize,
    real_size: usize,
  ) -> Result<BlockRef> {
    // Free blocks never touch, so a missing forward candidate means this
    // block ends at the break.
    let at = if free.fwd_cand.is_none() {
      let shortfall = real_size - (FREE_HEADER_SIZE + free.length);
      self.grow(shortfall)?;
      log::trace!("absorbing free tail {last_free}, short by {shortfall}");

      match free.prev_free {
        Some(prev) => self.update_free(prev, |header| header.next_free = None),
        None => self.free_block_list = None,
      }
      self.write_alloc(
        last_free,
        AllocHeader {
          length: size,
          back_merge: None,
          fwd_merge: None,
          prev_alloc: free.back_cand,
          next_alloc: None,
        },
      );
      last_free
    } else {
      let at = self.grow(real_size)?;
      self.write_alloc(
        at,
        AllocHeader {
          length: size,
          back_merge: None,
          fwd_merge: None,
          prev_alloc: self.last_alloc_block,
          next_alloc: None,
        },
      );
      at
    };

    if let Some(last) = self.last_alloc_block {
      self.update_alloc(last, |header| {
        header.fwd_merge = None;
        header.next_alloc = Some(at);
      });
    }
    self.last_alloc_block = Some(at);
    Ok(at)
  }

  /// Carves the allocation out of the high end of `at`, which stays free.
  fn split(
    &mut self,
    at: BlockRef,
    free: FreeHeader,
    size: usize,
    real_size: usize,
  ) -> BlockRef {
    let remaining = free.length - real_size;
    let new_at = BlockRef(at.0 + FREE_HEADER_SIZE + remaining);
    log::trace!("splitting free block {at}, {remaining} bytes stay free");

    self.write_alloc(
      new_at,
      AllocHeader {
        length: size,
        back_merge: Some(at),
        fwd_merge: None,
        prev_alloc: None,
        next_alloc: free.fwd_cand,
      },
    );

    match free.fwd_cand {
      Some(fwd) => self.update_alloc(fwd, |header| {
        header.back_merge = None;
        header.prev_alloc = Some(new_at);
      }),
      None => self.last_alloc_block = Some(new_at),
    }

    self.write_free(
      at,
      FreeHeader {
        length: remaining,
        fwd_cand: Some(new_at),
        ..free
      },
    );
    new_at
  }

  /// The surplus is too small to stand alone, so the whole free block becomes
  /// the allocation.
  fn take_whole(
    &mut self,
    at: BlockRef,
    free: FreeHeader,
  ) -> BlockRef {
    log::trace!("taking free block {at} whole");
    self.unlink_free(free);

    if let Some(back) = free.back_cand {
      self.update_alloc(back, |header| {
        header.fwd_merge = None;
        header.next_alloc = Some(at);
      });
    }
    match free.fwd_cand {
      Some(fwd) => self.update_alloc(fwd, |header| {
        header.back_merge = None;
        header.prev_alloc = Some(at);
      }),
      None => self.last_alloc_block = Some(at),
    }

    self.write_alloc(
      at,
      AllocHeader {
        length: FREE_HEADER_SIZE + free.length - ALLOC_HEADER_SIZE,
        back_merge: None,
        fwd_merge: None,
        prev_alloc: free.back_cand,
        next_alloc: free.fwd_cand,
      },
    );
    at
  }

  /// Free blocks on both sides: everything folds into the one behind.
  fn merge_both(
    &mut self,
    at: BlockRef,
    header: AllocHeader,
    back: BlockRef,
    fwd: BlockRef,
  ) {
    log::trace!("merging {back}, {at} and {fwd}");
    let ahead = self.free_header(fwd);

    self.update_free(back, |merged| {
      merged.length += ALLOC_HEADER_SIZE + header.length + FREE_HEADER_SIZE + ahead.length;
      merged.next_free = ahead.next_free;
      merged.fwd_cand = ahead.fwd_cand;
    });
    if let Some(cand) = ahead.fwd_cand {
      self.update_alloc(cand, |header| header.back_merge = Some(back));
    }
    if let Some(next) = ahead.next_free {
      self.update_free(next, |header| header.prev_free = Some(back));
    }

    self.scrub(at);
    self.scrub(fwd);
  }

  fn merge_back(
    &mut self,
    at: BlockRef,
    header: AllocHeader,
    back: BlockRef,
  ) {
    log::trace!("merging {at} into {back}");

    self.update_free(back, |merged| {
      merged.length += ALLOC_HEADER_SIZE + header.length;
      merged.fwd_cand = header.next_alloc;
    });
    if let Some(next) = header.next_alloc {
      self.update_alloc(next, |header| {
        header.back_merge = Some(back);
        header.prev_alloc = None;
      });
    }

    self.scrub(at);
  }

  /// The freed block survives and takes over the free block ahead of it,
  /// including its place in the free list.
  fn merge_fwd(
    &mut self,
    at: BlockRef,
    header: AllocHeader,
    fwd: BlockRef,
  ) {
    log::trace!("merging {fwd} into {at}");
    let ahead = self.free_header(fwd);

    match ahead.prev_free {
      Some(prev) => self.update_free(prev, |header| header.next_free = Some(at)),
      None => self.free_block_list = Some(at),
    }
    if let Some(next) = ahead.next_free {
      self.update_free(next, |header| header.prev_free = Some(at));
    }
    if let Some(cand) = ahead.fwd_cand {
      self.update_alloc(cand, |header| header.back_merge = Some(at));
    }
    if let Some(prev) = header.prev_alloc {
      self.update_alloc(prev, |header| {
        header.fwd_merge = Some(at);
        header.next_alloc = None;
      });
    }

    self.scrub(fwd);
    self.write_free(
      at,
      FreeHeader {
        length: ALLOC_HEADER_SIZE + header.length + ahead.length,
        prev_free: ahead.prev_free,
        next_free: ahead.next_free,
        back_cand: header.prev_alloc,
        fwd_cand: ahead.fwd_cand,
      },
    );
  }

  /// No free neighbors: the block becomes a free block of its own and is
  /// linked into the free list at its address-ordered position.
  fn release_isolated(
    &mut self,
    at: BlockRef,
    header: AllocHeader,
  ) {
    let mut freed = FreeHeader {
      length: ALLOC_HEADER_SIZE + header.length - FREE_HEADER_SIZE,
      prev_free: None,
      next_free: None,
      back_cand: header.prev_alloc,
      fwd_cand: header.next_alloc,
    };

    if let Some(prev) = header.prev_alloc {
      self.update_alloc(prev, |header| {
        header.fwd_merge = Some(at);
        header.next_alloc = None;
      });
    }
    if let Some(next) = header.next_alloc {
      self.update_alloc(next, |header| {
        header.back_merge = Some(at);
        header.prev_alloc = None;
      });
    }

    if let Some(head) = self.free_block_list {
      match self.nearest_free_behind(header.prev_alloc) {
        Some(prev) => {
          let next = self.free_header(prev).next_free;
          self.update_free(prev, |header| header.next_free = Some(at));
          if let Some(next) = next {
            self.update_free(next, |header| header.prev_free = Some(at));
          }
          freed.prev_free = Some(prev);
          freed.next_free = next;
        }
        // Nothing free behind us, so the current head is the next free block.
        None => {
          self.update_free(head, |header| header.prev_free = Some(at));
          freed.next_free = Some(head);
          self.free_block_list = Some(at);
        }
      }
    } else {
      self.free_block_list = Some(at);
    }

    log::trace!(
      "releasing {at} as a new free block between {:?} and {:?}",
      freed.prev_free,
      freed.next_free
    );
    self.write_free(at, freed);
  }

  /// Walks allocated neighbors toward `heap_start` until one borders a free
  /// block. Recently allocated blocks tend to be freed first and sit at the
  /// high end of free blocks, so this direction usually ends quickly.
  fn nearest_free_behind(
    &self,
    mut cursor: Option<BlockRef>,
  ) -> Option<BlockRef> {
    while let Some(at) = cursor {
      let header = self.alloc_header(at);
      if header.back_merge.is_some() {
        return header.back_merge;
      }
      cursor = header.prev_alloc;
    }
    None
  }

  fn unlink_free(
    &mut self,
    free: FreeHeader,
  ) {
    match free.prev_free {
      Some(prev) => self.update_free(prev, |header| header.next_free = free.next_free),
      None => self.free_block_list = free.next_free,
    }
    if let Some(next) = free.next_free {
      self.update_free(next, |header| header.prev_free = free.prev_free);
    }
  }

  pub(crate) fn read(
    &self,
    at: BlockRef,
  ) -> Header {
    let bytes = &self.brk.memory()[at.0..at.0 + MIN_BLOCK_SIZE];
    match Header::decode(bytes) {
      Some(header) => header,
      None => panic!("no block header at {at}"),
    }
  }

  pub(crate) fn alloc_header(
    &self,
    at: BlockRef,
  ) -> AllocHeader {
    match self.read(at) {
      Header::Allocated(header) => header,
      Header::Free(_) => panic!("block at {at} is not allocated"),
    }
  }

  pub(crate) fn free_header(
    &self,
    at: BlockRef,
  ) -> FreeHeader {
    match self.read(at) {
      Header::Free(header) => header,
      Header::Allocated(_) => panic!("block at {at} is not free"),
    }
  }

  fn write(
    &mut self,
    at: BlockRef,
    header: Header,
  ) {
    header.encode(&mut self.brk.memory_mut()[at.0..at.0 + MIN_BLOCK_SIZE]);
  }

  fn write_alloc(
    &mut self,
    at: BlockRef,
    header: AllocHeader,
  ) {
    self.write(at, Header::Allocated(header));
  }

  fn write_free(
    &mut self,
    at: BlockRef,
    header: FreeHeader,
  ) {
    self.write(at, Header::Free(header));
  }

  fn update_alloc(
    &mut self,
    at: BlockRef,
    f: impl FnOnce(&mut AllocHeader),
  ) {
    let mut header = self.alloc_header(at);
    f(&mut header);
    self.write_alloc(at, header);
  }

  fn update_free(
    &mut self,
    at: BlockRef,
    f: impl FnOnce(&mut FreeHeader),
  ) {
    let mut header = self.free_header(at);
    f(&mut header);
    self.write_free(at, header);
  }

  /// Wipes the header of a block that disappeared into a merge.
  #[cfg(debug_assertions)]
  fn scrub(
    &mut self,
    at: BlockRef,
  ) {
    crate::block::scrub(&mut self.brk.memory_mut()[at.0..at.0 + MIN_BLOCK_SIZE]);
  }

  #[cfg(not(debug_assertions))]
  fn scrub(
    &mut self,
    _at: BlockRef,
  ) {
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::inspect::BlockKind;
  use proptest::prelude::*;

  const H: usize = ALLOC_HEADER_SIZE;
  const M: usize = MIN_BLOCK_SIZE;

  /// Wraps a region and records every increment asked of it.
  struct Recording {
    inner: FixedRegion,
    increments: Vec<usize>,
  }

  impl Recording {
    fn new(capacity: usize) -> Self {
      Self {
        inner: FixedRegion::new(capacity),
        increments: Vec::new(),
      }
    }
  }

  impl ProgramBreak for Recording {
    fn extend(
      &mut self,
      increment: usize,
    ) -> Result<()> {
      self.increments.push(increment);
      self.inner.extend(increment)
    }

    fn memory(&self) -> &[u8] {
      self.inner.memory()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
      self.inner.memory_mut()
    }
  }

  fn block(handle: Handle) -> BlockRef {
    handle.block()
  }

  fn free_list(arena: &Arena<impl ProgramBreak>) -> Vec<(usize, usize)> {
    arena.free_blocks().map(|info| (info.offset, info.length)).collect()
  }

  #[test]
  fn test_free_none_is_noop() {
    let mut arena = Arena::with_capacity(1024);
    arena.deallocate(None);
    assert_eq!(arena.program_break(), 0);
    assert_eq!(arena.free_list_head(), None);
    assert_eq!(arena.last_alloc_block(), None);
  }

  #[test]
  fn test_zero_size() {
    let _ = env_logger::try_init();
    let mut arena = Arena::with_capacity(1024);

    let p = arena.allocate(0).unwrap();
    assert_eq!(arena.program_break(), H);
    assert_eq!(arena.free_list_head(), None);
    assert_eq!(arena.last_alloc_block(), Some(p));
    assert_eq!(p.offset(), H);
    assert!(arena.body(p).is_empty());

    let q = arena.allocate(0).unwrap();
    assert_ne!(p, q);
    assert_eq!(arena.program_break(), 2 * H);

    arena.deallocate(Some(p));
    assert_eq!(free_list(&arena), vec![(0, 0)]);
    arena.deallocate(Some(q));
    assert_eq!(free_list(&arena), vec![(0, 2 * H - FREE_HEADER_SIZE)]);
    assert_eq!(arena.last_alloc_block(), None);
  }

  #[test]
  fn test_body_is_writable() {
    let mut arena = Arena::with_capacity(1024);

    let first = arena.allocate(8).unwrap();
    arena.body_mut(first).copy_from_slice(&3u64.to_le_bytes());

    let second = arena.allocate(12).unwrap();
    arena.body_mut(second).fill(0xAB);

    assert_eq!(arena.body(first), &3u64.to_le_bytes());
    assert_eq!(arena.body(second), &[0xABu8; 12]);
    assert_eq!(arena.as_ptr(second), unsafe { arena.as_ptr(first).add(8 + H) });
  }

  #[test]
  fn test_tail_is_reused() {
    let mut arena = Arena::with_capacity(1024);

    let p = arena.allocate(1).unwrap();
    assert_eq!(arena.program_break(), H + 1);
    arena.deallocate(Some(p));
    assert_eq!(free_list(&arena), vec![(0, 1)]);

    let again = arena.allocate(1).unwrap();
    assert_eq!(again, p);
    assert_eq!(arena.program_break(), H + 1);
    assert_eq!(arena.block_len(again), 1);
    assert_eq!(arena.free_list_head(), None);
  }

  #[test]
  fn test_first_fit() {
    let mut arena = Arena::with_capacity(4096);

    let a = arena.allocate(10).unwrap();
    let _x = arena.allocate(0).unwrap();
    let b = arena.allocate(50).unwrap();
    let _y = arena.allocate(0).unwrap();
    let c = arena.allocate(30).unwrap();
    let _z = arena.allocate(0).unwrap();

    arena.deallocate(Some(a));
    arena.deallocate(Some(b));
    arena.deallocate(Some(c));
    assert_eq!(
      free_list(&arena).iter().map(|(_, len)| *len).collect::<Vec<_>>(),
      vec![10, 50, 30]
    );

    let brk = arena.program_break();
    let p = arena.allocate(20).unwrap();
    assert_eq!(p, b);
    assert_eq!(arena.program_break(), brk);
    assert_eq!(
      free_list(&arena),
      vec![(block(a).offset(), 10), (block(c).offset(), 30)]
    );
  }

  #[test]
  fn test_double_merge() {
    let mut arena = Arena::with_capacity(1024);

    let a = arena.allocate(8).unwrap();
    let b = arena.allocate(16).unwrap();
    let c = arena.allocate(24).unwrap();
    let guard = arena.allocate(0).unwrap();

    arena.deallocate(Some(a));
    arena.deallocate(Some(c));
    assert_eq!(arena.free_blocks().count(), 2);

    arena.deallocate(Some(b));
    let span = (H + 8) + (H + 16) + (H + 24);
    assert_eq!(free_list(&arena), vec![(0, span - FREE_HEADER_SIZE)]);

    let merged = arena.free_header(BlockRef(0));
    assert_eq!(merged.back_cand, None);
    assert_eq!(merged.fwd_cand, Some(block(guard)));
    assert_eq!(arena.alloc_header(block(guard)).back_merge, Some(BlockRef(0)));
    assert_eq!(arena.last_alloc_block(), Some(guard));
  }

  #[test]
  fn test_double_merge_whole_arena() {
    let mut arena = Arena::with_capacity(1024);

    let a = arena.allocate(8).unwrap();
    let b = arena.allocate(16).unwrap();
    let c = arena.allocate(24).unwrap();

    arena.deallocate(Some(a));
    arena.deallocate(Some(c));
    assert_eq!(arena.last_alloc_block(), Some(b));
    arena.deallocate(Some(b));

    assert_eq!(free_list(&arena), vec![(0, arena.program_break() - FREE_HEADER_SIZE)]);
    assert_eq!(arena.last_alloc_block(), None);
  }

  #[test]
  fn test_growth_minimization() {
    let mut arena = Arena::new(Recording::new(4096));

    let _x = arena.allocate(0).unwrap();
    let t = arena.allocate(100).unwrap();
    arena.deallocate(Some(t));
    assert_eq!(arena.growth().increments, vec![H, H + 100]);

    // Tail footprint is FREE_HEADER_SIZE + 100, the request needs H + 200.
    let brk = arena.program_break();
    let p = arena.allocate(200).unwrap();
    assert_eq!(p, t);
    assert_eq!(arena.growth().increments.last(), Some(&100));
    assert_eq!(arena.program_break(), brk + 100);
    assert_eq!(arena.free_list_head(), None);
    assert_eq!(arena.last_alloc_block(), Some(p));
  }

  #[test]
  fn test_growth_past_allocated_tail() {
    let mut arena = Arena::new(Recording::new(4096));

    let a = arena.allocate(10).unwrap();
    let tail = arena.allocate(0).unwrap();
    arena.deallocate(Some(a));

    let p = arena.allocate(64).unwrap();
    assert_eq!(arena.growth().increments.last(), Some(&(H + 64)));
    assert_eq!(block(p).offset(), 2 * H + 10);

    let header = arena.alloc_header(block(p));
    assert_eq!(header.prev_alloc, Some(block(tail)));
    assert_eq!(arena.alloc_header(block(tail)).next_alloc, Some(block(p)));
    assert_eq!(arena.last_alloc_block(), Some(p));
    assert_eq!(free_list(&arena), vec![(0, 10)]);
  }

  #[test]
  fn test_split_threshold() {
    // Leaves exactly MIN_BLOCK_SIZE behind: split.
    let mut arena = Arena::with_capacity(1024);
    let a = arena.allocate(100).unwrap();
    let _guard = arena.allocate(0).unwrap();
    arena.deallocate(Some(a));

    let p = arena.allocate(100 - M).unwrap();
    assert_ne!(p, a);
    assert_eq!(p.offset(), FREE_HEADER_SIZE + H);
    assert_eq!(free_list(&arena), vec![(0, 0)]);
    assert_eq!(arena.block_len(p), 100 - M);

    // One byte short of a valid remainder: taken whole.
    let mut arena = Arena::with_capacity(1024);
    let a = arena.allocate(100).unwrap();
    let _guard = arena.allocate(0).unwrap();
    arena.deallocate(Some(a));

    let p = arena.allocate(100 - M + 1).unwrap();
    assert_eq!(p, a);
    assert_eq!(arena.block_len(p), 100);
    assert_eq!(arena.free_list_head(), None);
  }

  #[test]
  fn test_exhaustion_leaves_arena_unchanged() {
    let mut arena = Arena::with_capacity(2 * H + 16);

    let a = arena.allocate(16).unwrap();
    let _b = arena.allocate(0).unwrap();
    arena.deallocate(Some(a));
    let before = free_list(&arena);

    assert_eq!(arena.allocate(64), Err(Error::Exhausted { requested: H + 64 }));
    assert_eq!(free_list(&arena), before);
    assert_eq!(arena.program_break(), 2 * H + 16);
    arena.check_integrity();

    let mut arena = Arena::with_capacity(H);
    assert!(arena.allocate(1).is_err());
    assert_eq!(arena.program_break(), 0);
    assert_eq!(
      arena.allocate(usize::MAX),
      Err(Error::Exhausted {
        requested: usize::MAX
      })
    );
    assert_eq!(
      arena.allocate(usize::MAX - H + 1),
      Err(Error::Exhausted {
        requested: usize::MAX
      })
    );
    assert_eq!(arena.program_break(), 0);
  }

  #[test]
  fn test_exhaustion_on_free_tail() {
    let mut arena = Arena::with_capacity(2 * H + 16);

    let _a = arena.allocate(0).unwrap();
    let b = arena.allocate(16).unwrap();
    arena.deallocate(Some(b));

    // Shortfall is 48 bytes, region only has room for none.
    assert_eq!(arena.allocate(64), Err(Error::Exhausted { requested: 48 }));
    assert_eq!(free_list(&arena), vec![(H, 16)]);
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "no block header")]
  fn test_double_free_after_merge_panics() {
    let mut arena = Arena::with_capacity(1024);
    let a = arena.allocate(8).unwrap();
    let b = arena.allocate(8).unwrap();
    arena.deallocate(Some(a));
    arena.deallocate(Some(b));
    arena.deallocate(Some(b));
  }

  #[test]
  #[should_panic(expected = "is not allocated")]
  fn test_double_free_panics() {
    let mut arena = Arena::with_capacity(1024);
    let a = arena.allocate(8).unwrap();
    let _b = arena.allocate(8).unwrap();
    arena.deallocate(Some(a));
    arena.deallocate(Some(a));
  }

  /// The scripted sequence from the original exercise: zero-size blocks, tail
  /// absorption, a strided alloc/free pattern, first-fit reuse and a double
  /// merge, checking the exact links after each step.
  #[test]
  fn test_scripted_sequence() {
    let _ = env_logger::try_init();
    let mut arena = Arena::with_capacity(16 * M);
    let at = |offset: usize| Some(BlockRef(offset));

    // 0-byte allocation only costs a header.
    let p = arena.allocate(0).unwrap();
    assert_eq!(arena.program_break(), H);
    arena.deallocate(Some(p));
    assert_eq!(arena.free_list_head(), at(0));
    assert_eq!(arena.free_header(BlockRef(0)).length, 0);

    // 1 byte grows the break by a single byte.
    let p = arena.allocate(1).unwrap();
    assert_eq!(arena.program_break(), H + 1);
    arena.deallocate(Some(p));

    // MIN_BLOCK_SIZE bytes, freed, then two 0-length blocks out of it.
    let p = arena.allocate(M).unwrap();
    assert_eq!(arena.program_break(), H + M);
    assert_eq!(arena.block_len(p), M);
    arena.deallocate(Some(p));
    assert_eq!(free_list(&arena), vec![(0, M)]);

    let p = arena.allocate(0).unwrap();
    assert_eq!(free_list(&arena), vec![(0, 0)]);
    assert_eq!(arena.last_alloc_block(), Some(p));
    let pp = arena.allocate(0).unwrap();
    assert_eq!(pp.offset(), H);
    assert_eq!(arena.free_list_head(), None);

    arena.deallocate(Some(pp));
    let free = arena.free_header(BlockRef(0));
    assert_eq!(free.fwd_cand, Some(block(p)));
    assert_eq!(free.back_cand, None);
    let last = arena.alloc_header(block(p));
    assert_eq!(last.back_merge, at(0));
    assert_eq!(last.prev_alloc, None);
    arena.deallocate(Some(p));
    assert_eq!(free_list(&arena), vec![(0, M)]);
    assert_eq!(arena.last_alloc_block(), None);

    // Forward merge into the freed block, which keeps the list head.
    let p = arena.allocate(0).unwrap();
    let pp = arena.allocate(0).unwrap();
    arena.deallocate(Some(p));
    assert_eq!(arena.free_list_head(), Some(block(p)));
    assert_eq!(arena.free_header(block(p)).back_cand, Some(block(pp)));
    assert_eq!(arena.last_alloc_block(), Some(pp));
    arena.deallocate(Some(pp));
    assert_eq!(free_list(&arena), vec![(0, M)]);
    let free = arena.free_header(BlockRef(0));
    assert_eq!((free.back_cand, free.fwd_cand), (None, None));

    // Fill, grow, then split the first block into three allocations.
    let p = arena.allocate(M).unwrap();
    let ppp = arena.allocate(2 * M).unwrap();
    assert_eq!(arena.program_break(), 5 * M);
    assert_eq!(arena.alloc_header(block(ppp)).prev_alloc, Some(block(p)));
    arena.deallocate(Some(p));
    let pp = arena.allocate(0).unwrap();
    let p = arena.allocate(0).unwrap();
    assert_eq!(arena.free_list_head(), None);
    assert_eq!(block(p).offset(), 0);
    assert_eq!(arena.alloc_header(block(pp)).prev_alloc, Some(block(p)));
    assert_eq!(arena.alloc_header(block(pp)).next_alloc, Some(block(ppp)));

    // Free the middle block.
    arena.deallocate(Some(pp));
    assert_eq!(arena.free_list_head(), Some(block(pp)));
    let free = arena.free_header(block(pp));
    assert_eq!(free.back_cand, Some(block(p)));
    assert_eq!(free.fwd_cand, Some(block(ppp)));
    assert_eq!(arena.alloc_header(block(p)).fwd_merge, Some(block(pp)));
    assert_eq!(arena.alloc_header(block(ppp)).back_merge, Some(block(pp)));

    // Strided pattern: alloc - free - alloc - free - alloc.
    arena.deallocate(Some(ppp));
    assert_eq!(free_list(&arena), vec![(H, 3 * M)]);
    assert_eq!(arena.last_alloc_block(), Some(p));
    let ppp = arena.allocate(0).unwrap();
    assert_eq!(free_list(&arena), vec![(H, 2 * M)]);
    let pppp = arena.allocate(0).unwrap();
    assert_eq!(free_list(&arena), vec![(H, M)]);
    let pp = arena.allocate(0).unwrap();
    assert_eq!(free_list(&arena), vec![(H, 0)]);
    assert_eq!(arena.last_alloc_block(), Some(ppp));
    arena.deallocate(Some(pppp));
    let f = block(pppp);
    assert_eq!(free_list(&arena), vec![(H, 0), (f.offset(), 0)]);
    let free = arena.free_header(f);
    assert_eq!(free.back_cand, Some(block(pp)));
    assert_eq!(free.fwd_cand, Some(block(ppp)));
    assert_eq!(arena.alloc_header(block(pp)).back_merge, Some(BlockRef(H)));
    assert_eq!(arena.alloc_header(block(pp)).fwd_merge, Some(f));

    // Nothing fits and the tail is allocated: grow at the break.
    let pppp = arena.allocate(M).unwrap();
    assert_eq!(arena.program_break(), 7 * M);
    assert_eq!(arena.last_alloc_block(), Some(pppp));
    assert_eq!(arena.alloc_header(block(pppp)).prev_alloc, Some(block(ppp)));
    arena.deallocate(Some(pppp));
    let ff = block(pppp);
    assert_eq!(free_list(&arena), vec![(H, 0), (f.offset(), 0), (ff.offset(), M)]);
    assert_eq!(arena.last_alloc_block(), Some(ppp));

    // First fit takes the lowest free block whole.
    let pppp = arena.allocate(0).unwrap();
    assert_eq!(pppp.offset(), 2 * H);
    assert_eq!(free_list(&arena), vec![(f.offset(), 0), (ff.offset(), M)]);
    assert_eq!(arena.alloc_header(block(p)).next_alloc, Some(block(pppp)));
    assert_eq!(arena.alloc_header(block(pp)).prev_alloc, Some(block(pppp)));

    // Freed again with no free block behind it: becomes the list head.
    arena.deallocate(Some(pppp));
    assert_eq!(free_list(&arena), vec![(H, 0), (f.offset(), 0), (ff.offset(), M)]);
    let pppp = arena.allocate(0).unwrap();

    // Free first, third, then second.
    arena.deallocate(Some(p));
    assert_eq!(free_list(&arena), vec![(0, 0), (f.offset(), 0), (ff.offset(), M)]);
    arena.deallocate(Some(pp));
    assert_eq!(free_list(&arena), vec![(0, 0), (block(pp).offset(), M), (ff.offset(), M)]);
    assert_eq!(arena.free_header(block(pp)).back_cand, Some(block(pppp)));
    assert_eq!(arena.alloc_header(block(ppp)).back_merge, Some(block(pp)));
    arena.deallocate(Some(pppp));
    assert_eq!(free_list(&arena), vec![(0, 3 * M), (ff.offset(), M)]);
    assert_eq!(arena.alloc_header(block(ppp)).back_merge, at(0));
    assert_eq!(arena.alloc_header(block(ppp)).fwd_merge, Some(ff));

    arena.deallocate(Some(ppp));
    assert_eq!(free_list(&arena), vec![(0, 7 * M - FREE_HEADER_SIZE)]);
    assert_eq!(arena.last_alloc_block(), None);
  }

  #[derive(Clone, Debug)]
  enum Op {
    Alloc(usize),
    Free(prop::sample::Index),
  }

  fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
      prop_oneof![
        (0usize..256).prop_map(Op::Alloc),
        any::<prop::sample::Index>().prop_map(Op::Free),
      ],
      0..128,
    )
  }

  fn run(
    arena: &mut Arena<FixedRegion>,
    ops: Vec<Op>,
  ) -> Vec<Handle> {
    let mut live = Vec::new();
    for op in ops {
      match op {
        Op::Alloc(size) => {
          let handle = arena.allocate(size).unwrap();
          assert!(arena.block_len(handle) >= size);
          arena.body_mut(handle).fill(0xCD);
          live.push(handle);
        }
        Op::Free(index) if !live.is_empty() => {
          let handle = live.swap_remove(index.index(live.len()));
          arena.deallocate(Some(handle));
        }
        Op::Free(_) => {}
      }
      arena.check_integrity();
    }
    live
  }

  proptest! {
    /// Any sequence keeps the arena tiled with maximally coalesced free
    /// blocks, and freeing everything leaves one free block spanning it.
    #[test]
    fn check_no_fragmentation(ops in ops()) {
      let _ = env_logger::try_init();
      let mut arena = Arena::with_capacity(64 * 1024);

      let live = run(&mut arena, ops);

      let covered: usize = arena.blocks().map(|info| info.footprint()).sum();
      prop_assert_eq!(covered, arena.program_break());
      prop_assert_eq!(
        arena.blocks().filter(|info| info.kind == BlockKind::Allocated).count(),
        live.len()
      );

      for handle in live {
        arena.deallocate(Some(handle));
      }
      prop_assert_eq!(arena.last_alloc_block(), None);
      if arena.program_break() == 0 {
        prop_assert_eq!(arena.free_list_head(), None);
      } else {
        prop_assert_eq!(
          free_list(&arena),
          vec![(0, arena.program_break() - FREE_HEADER_SIZE)]
        );
      }
    }

    /// Allocating and immediately freeing restores the free list whenever the
    /// request did not grow the arena.
    #[test]
    fn check_round_trip(ops in ops(), size in 0usize..512) {
      let mut arena = Arena::with_capacity(64 * 1024);
      let _live = run(&mut arena, ops);

      let before = free_list(&arena);
      let brk = arena.program_break();
      let handle = arena.allocate(size).unwrap();
      arena.deallocate(Some(handle));

      if arena.program_break() == brk {
        prop_assert_eq!(free_list(&arena), before);
      } else {
        let program_break = arena.program_break();
        let tail = free_list(&arena).last().copied();
        let ends_at_break =
          tail.is_some_and(|(offset, length)| offset + FREE_HEADER_SIZE + length == program_break);
        prop_assert!(ends_at_break, "free tail {:?} does not reach {:#x}", tail, program_break);
      }
    }
  }
}

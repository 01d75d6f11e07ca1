use std::fmt;

/// Size of one header word. Headers are stored as little-endian `u64`s so the
/// layout does not depend on the pointer width.
pub const WORD: usize = 8;

const HEADER_WORDS: usize = 6;

/// Bytes in front of the body of an allocated block.
pub const ALLOC_HEADER_SIZE: usize = HEADER_WORDS * WORD;

/// Bytes in front of the body of a free block.
pub const FREE_HEADER_SIZE: usize = HEADER_WORDS * WORD;

/// Smallest footprint any block may have, so that a block of either kind can
/// be rewritten as the other kind without touching its neighbors.
pub const MIN_BLOCK_SIZE: usize = max(ALLOC_HEADER_SIZE, FREE_HEADER_SIZE);

/// Requests are padded to at least this many body bytes.
pub const MIN_BODY_SIZE: usize = FREE_HEADER_SIZE.saturating_sub(ALLOC_HEADER_SIZE);

const TAG_ALLOCATED: u64 = 0xa110_c8ed_b10c_0001;
const TAG_FREE: u64 = 0xf2ee_b10c_f2ee_0002;
#[cfg(debug_assertions)]
const TAG_SCRUBBED: u64 = 0;
const NIL: u64 = u64::MAX;

const fn max(
  a: usize,
  b: usize,
) -> usize {
  if a > b { a } else { b }
}

/// Offset of a block header from the start of the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(pub(crate) usize);

impl BlockRef {
  pub fn offset(self) -> usize {
    self.0
  }

  /// Handle to the body of this block once it is allocated.
  pub(crate) fn body(self) -> Handle {
    Handle(self.0 + ALLOC_HEADER_SIZE)
  }
}

impl fmt::Display for BlockRef {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

/// Offset of an allocated body from the start of the arena.
///
/// This is what [`Arena::allocate`](crate::Arena::allocate) hands out in place
/// of a raw pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub(crate) usize);

impl Handle {
  pub fn offset(self) -> usize {
    self.0
  }

  /// The header sits immediately behind the body.
  pub(crate) fn block(self) -> BlockRef {
    BlockRef(self.0 - ALLOC_HEADER_SIZE)
  }
}

impl fmt::Display for Handle {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

/// Metadata of an allocated block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocHeader {
  pub length: usize,
  /// Free block directly behind, if the neighbor behind is free.
  pub back_merge: Option<BlockRef>,
  /// Free block directly ahead, if the neighbor ahead is free.
  pub fwd_merge: Option<BlockRef>,
  /// Allocated block directly behind, if the neighbor behind is allocated.
  pub prev_alloc: Option<BlockRef>,
  /// Allocated block directly ahead, if the neighbor ahead is allocated.
  pub next_alloc: Option<BlockRef>,
}

/// Metadata of a free block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeHeader {
  pub length: usize,
  pub prev_free: Option<BlockRef>,
  pub next_free: Option<BlockRef>,
  /// Allocated block directly behind, which merges into this one when freed.
  pub back_cand: Option<BlockRef>,
  /// Allocated block directly ahead, which merges into this one when freed.
  pub fwd_cand: Option<BlockRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Header {
  Allocated(AllocHeader),
  Free(FreeHeader),
}

impl Header {
  pub fn length(&self) -> usize {
    match self {
      Header::Allocated(header) => header.length,
      Header::Free(header) => header.length,
    }
  }

  /// Header plus body.
  pub fn footprint(&self) -> usize {
    match self {
      Header::Allocated(header) => ALLOC_HEADER_SIZE + header.length,
      Header::Free(header) => FREE_HEADER_SIZE + header.length,
    }
  }

  /// Reads a header from the start of `bytes`.
  ///
  /// Returns `None` when the tag is neither kind, which happens for foreign
  /// offsets and for headers scrubbed by a merge.
  pub fn decode(bytes: &[u8]) -> Option<Header> {
    let word = |i: usize| -> u64 {
      let mut raw = [0u8; WORD];
      raw.copy_from_slice(&bytes[i * WORD..(i + 1) * WORD]);
      u64::from_le_bytes(raw)
    };
    let link = |i: usize| -> Option<BlockRef> {
      match word(i) {
        NIL => None,
        offset => usize::try_from(offset).ok().map(BlockRef),
      }
    };
    let length = usize::try_from(word(1)).ok()?;

    match word(0) {
      TAG_ALLOCATED => Some(Header::Allocated(AllocHeader {
        length,
        back_merge: link(2),
        fwd_merge: link(3),
        prev_alloc: link(4),
        next_alloc: link(5),
      })),
      TAG_FREE => Some(Header::Free(FreeHeader {
        length,
        prev_free: link(2),
        next_free: link(3),
        back_cand: link(4),
        fwd_cand: link(5),
      })),
      _ => None,
    }
  }

  /// Writes this header over the start of `bytes`.
  pub fn encode(
    &self,
    bytes: &mut [u8],
  ) {
    let words = match self {
      Header::Allocated(header) => [
        TAG_ALLOCATED,
        header.length as u64,
        link_word(header.back_merge),
        link_word(header.fwd_merge),
        link_word(header.prev_alloc),
        link_word(header.next_alloc),
      ],
      Header::Free(header) => [
        TAG_FREE,
        header.length as u64,
        link_word(header.prev_free),
        link_word(header.next_free),
        link_word(header.back_cand),
        link_word(header.fwd_cand),
      ],
    };
    write_words(bytes, &words);
  }
}

/// Clears the tag so the stale header can no longer be mistaken for a block.
#[cfg(debug_assertions)]
pub fn scrub(bytes: &mut [u8]) {
  write_words(bytes, &[TAG_SCRUBBED]);
}

fn link_word(link: Option<BlockRef>) -> u64 {
  link.map_or(NIL, |block| block.0 as u64)
}

fn write_words(
  bytes: &mut [u8],
  words: &[u64],
) {
  for (chunk, word) in bytes.chunks_exact_mut(WORD).zip(words) {
    chunk.copy_from_slice(&word.to_le_bytes());
  }
}

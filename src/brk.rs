use crate::error::{Error, Result};

/// The one primitive the allocator sits on: a region that grows at its high
/// end.
///
/// `memory()` always covers exactly `[heap_start, program_break)`.
pub trait ProgramBreak {
  /// Grows the region by exactly `increment` bytes, or fails and leaves it
  /// untouched.
  fn extend(
    &mut self,
    increment: usize,
  ) -> Result<()>;

  fn memory(&self) -> &[u8];

  fn memory_mut(&mut self) -> &mut [u8];
}

/// The process program break, moved with `sbrk(2)`.
///
/// ```text
///   heap_start                         program_break
///       │                                    │
///       ▼                                    ▼
///   ────┬──────────┬──────────┬──────────────┬─────────────
///       │  block   │  block   │    block     │  unmapped
///   ────┴──────────┴──────────┴──────────────┴─────────────
///       └──────────── memory() ──────────────┘
/// ```
#[cfg(unix)]
pub struct Sbrk {
  start: *mut u8,
  len: usize,
}

#[cfg(unix)]
impl Sbrk {
  /// Takes the current program break as `heap_start`.
  ///
  /// # Safety
  ///
  /// Nothing else in the process may move the program break while this value
  /// is alive. That includes the system allocator when it is brk-based.
  pub unsafe fn new() -> Self {
    let start = unsafe { libc::sbrk(0) } as *mut u8;
    log::debug!("Sbrk::new() heap_start = {start:?}");
    Self { start, len: 0 }
  }

  pub fn heap_start(&self) -> *const u8 {
    self.start
  }
}

#[cfg(unix)]
impl ProgramBreak for Sbrk {
  fn extend(
    &mut self,
    increment: usize,
  ) -> Result<()> {
    let delta = libc::intptr_t::try_from(increment)
      .map_err(|_| Error::Exhausted { requested: increment })?;

    let previous = unsafe { libc::sbrk(delta) };
    if previous == usize::MAX as *mut libc::c_void {
      return Err(Error::Exhausted { requested: increment });
    }

    let expected = self.start.wrapping_add(self.len);
    if previous as *mut u8 != expected {
      return Err(Error::Discontiguous {
        expected: expected as usize,
        found: previous as usize,
      });
    }

    self.len += increment;
    Ok(())
  }

  fn memory(&self) -> &[u8] {
    if self.len == 0 {
      return &[];
    }
    unsafe { std::slice::from_raw_parts(self.start, self.len) }
  }

  fn memory_mut(&mut self) -> &mut [u8] {
    if self.len == 0 {
      return &mut [];
    }
    unsafe { std::slice::from_raw_parts_mut(self.start, self.len) }
  }
}

/// A bounded region reserved up front, with its own private break.
///
/// Useful where moving the real program break is not an option, such as
/// under a test harness that shares the process with the system allocator.
pub struct FixedRegion {
  memory: Box<[u8]>,
  brk: usize,
}

impl FixedRegion {
  pub fn new(capacity: usize) -> Self {
    Self {
      memory: vec![0; capacity].into_boxed_slice(),
      brk: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.memory.len()
  }
}

impl ProgramBreak for FixedRegion {
  fn extend(
    &mut self,
    increment: usize,
  ) -> Result<()> {
    if increment > self.memory.len() - self.brk {
      return Err(Error::Exhausted { requested: increment });
    }
    self.brk += increment;
    Ok(())
  }

  fn memory(&self) -> &[u8] {
    &self.memory[..self.brk]
  }

  fn memory_mut(&mut self) -> &mut [u8] {
    &mut self.memory[..self.brk]
  }
}

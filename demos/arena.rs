use std::io::Read;

use brkalloc::{Arena, Handle, Sbrk};
use libc::sbrk;

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`, `htop`,
/// `gdb`, or just visually track how allocations change the program break.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the current program break using `sbrk(0)`.
unsafe fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn print_alloc(
  arena: &Arena<Sbrk>,
  size: usize,
  handle: Handle,
) {
  println!(
    "Allocated {} bytes, address = {:?}, block length = {}, arena program break = {:#x}",
    size,
    arena.as_ptr(handle),
    arena.block_len(handle),
    arena.program_break()
  );
}

/// Exhaustion is fatal here: there is nothing sensible left to do.
fn allocate(
  arena: &mut Arena<Sbrk>,
  size: usize,
) -> Handle {
  match arena.allocate(size) {
    Ok(handle) => handle,
    Err(err) => {
      eprintln!("allocation of {size} bytes failed: {err}");
      std::process::exit(1);
    }
  }
}

fn main() {
  let _ = env_logger::try_init();

  unsafe {
    // Initial heap state
    print_program_break("start");
  }
  block_until_enter_pressed();

  // Everything the demo prints goes through the system allocator, which may
  // share the break with us. Anything it does after this point shows up as a
  // `Discontiguous` error.
  let mut arena = Arena::new(unsafe { Sbrk::new() });

  // --------------------------------------------------------------------
  // 1) Allocate space for a u32.
  // --------------------------------------------------------------------
  let first = allocate(&mut arena, 4);
  println!("\n[1] Allocate u32");
  print_alloc(&arena, 4, first);
  arena.body_mut(first).copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Allocate 12 bytes and fill them with a pattern.
  // --------------------------------------------------------------------
  let second = allocate(&mut arena, 12);
  println!("\n[2] Allocate [u8; 12]");
  print_alloc(&arena, 12, second);
  arena.body_mut(second).fill(0xAB);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Allocate a zero-sized block. It still costs a header.
  // --------------------------------------------------------------------
  let third = allocate(&mut arena, 0);
  println!("\n[3] Allocate 0 bytes");
  print_alloc(&arena, 0, third);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Free the first block, then ask for 2 bytes: first fit reuses it.
  // --------------------------------------------------------------------
  arena.deallocate(Some(first));
  println!("\n[4] Deallocated first block\n{arena}");
  let fourth = allocate(&mut arena, 2);
  print_alloc(&arena, 2, fourth);
  println!("[4] reused first block? {}", fourth == first);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) Free the last two blocks: they coalesce into one free tail.
  // --------------------------------------------------------------------
  arena.deallocate(Some(third));
  arena.deallocate(Some(second));
  println!("\n[5] Deallocated second and third blocks\n{arena}");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 6) Allocate 64 KiB. Only the part the free tail cannot cover is
  //    requested from the kernel.
  // --------------------------------------------------------------------
  let before = arena.program_break();
  let big = allocate(&mut arena, 64 * 1024);
  println!("\n[6] Allocate 64 KiB");
  print_alloc(&arena, 64 * 1024, big);
  println!("[6] arena grew by {} bytes", arena.program_break() - before);
  unsafe {
    print_program_break("after large alloc");
  }
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 7) Free everything. The break stays where it is.
  // --------------------------------------------------------------------
  arena.deallocate(Some(big));
  arena.deallocate(Some(fourth));
  println!("\n[7] Deallocated everything\n{arena}");
  unsafe {
    print_program_break("end");
  }
}

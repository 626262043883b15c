//! Backing memory for the heap.
//!
//! The allocator core never talks to the operating system directly. It grows
//! its heap through the [`HeapSource`] trait, which captures the three
//! primitives a classic `sbrk`-style break pointer provides: extend the
//! mapping, query its current end and obtain the base address. [`Arena`] is
//! the built-in implementation backed by a fixed, statically sized buffer, so
//! the whole heap lives in the `.bss`-section of the final binary.

use core::mem::MaybeUninit;

/// The heap could not be grown any further.
///
/// This is the only failure the memory source can report. It is surfaced to
/// the user as a null pointer from the allocation entry points; the allocator
/// never retries on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// A monotonically growable region of contiguous memory.
///
/// The allocator addresses every byte of the heap as an offset from
/// [`base`](Self::base). Offsets in `0..limit()` are valid; the region never
/// shrinks and never moves while the allocator is in use. Implementations
/// must hand out 8-byte aligned base addresses, since the block encoding
/// relies on payloads at `base + 8k` being well-aligned.
pub trait HeapSource {
    /// Grow the heap by `bytes` and return the offset of the new region.
    ///
    /// The caller is responsible for requesting a multiple of the alignment.
    /// On success the returned offset is the previous value of
    /// [`limit`](Self::limit).
    fn extend(&mut self, bytes: usize) -> Result<usize, OutOfMemory>;

    /// One past the highest currently valid heap offset.
    fn limit(&self) -> usize;

    /// The lowest address of the heap memory.
    fn base(&self) -> *const u8;

    /// The lowest address of the heap memory, mutably.
    fn base_mut(&mut self) -> *mut u8;
}

/// The buffer holding the heap bytes.
///
/// The alignment attribute is load-bearing: block headers live at offsets
/// `8k + 4` and payloads at offsets `8k`, so the buffer start must itself be
/// 8-byte aligned for the payload alignment guarantee to hold.
#[repr(align(8))]
struct Memory<const N: usize>([MaybeUninit<u8>; N]);

/// A fixed-capacity [`HeapSource`].
///
/// Models a growable heap on top of a buffer of `N` bytes: extensions are
/// granted by bumping a break offset until the capacity is exhausted. The
/// memory below the break is owned by the allocator, the memory above it is
/// uninitialized and untouched.
pub struct Arena<const N: usize> {
    memory: Memory<N>,
    brk: usize,
}

impl<const N: usize> Arena<N> {
    /// Create a new, fully uninitialized arena.
    ///
    /// # Panics
    /// This function panics if `N` is not a multiple of 8 or exceeds 4 GiB
    /// (offsets into the heap are stored as 4-byte words, see the block
    /// encoding).
    pub const fn new() -> Self {
        assert!(N % 8 == 0, "memory size has to be divisible by 8");
        assert!(N as u64 <= 1 << 32, "memory size must not exceed 4 GiB");

        Self {
            memory: Memory([MaybeUninit::uninit(); N]),
            brk: 0,
        }
    }
}

impl<const N: usize> HeapSource for Arena<N> {
    fn extend(&mut self, bytes: usize) -> Result<usize, OutOfMemory> {
        let new_brk = self.brk.checked_add(bytes).ok_or(OutOfMemory)?;
        if new_brk > N {
            return Err(OutOfMemory);
        }
        let old_brk = self.brk;
        self.brk = new_brk;
        Ok(old_brk)
    }

    fn limit(&self) -> usize {
        self.brk
    }

    fn base(&self) -> *const u8 {
        self.memory.0.as_ptr().cast()
    }

    fn base_mut(&mut self) -> *mut u8 {
        self.memory.0.as_mut_ptr().cast()
    }
}

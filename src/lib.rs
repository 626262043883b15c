//! Best-fit allocator with segregated free lists and a size-keyed search tree
//!
//! This crate provides a single type called [`Allocator`]. This type
//! implements the [`core::alloc::GlobalAlloc`]-trait, which is required to
//! use the [`alloc`-crate][alloc] on `#![no_std]`-targets. Unlike simple
//! scan-based allocators, this one keeps an index of its free memory, so it
//! stays fast when many blocks are live, while a best-fit placement policy
//! keeps fragmentation low.
//!
//! # Usage
//! The usage is simple: just copy and paste the following code snipped into
//! your binary crate and potentially adjust the number of bytes of the heap
//! (here 4K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: treealloc::Allocator<4096> = treealloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards you don't need to interact with the crate or the variable
//! `ALLOCATOR` anymore. Now you can just `use alloc::vec::Vec` or even
//! `use alloc::collections::BTreeMap`, i.e. every fancy collection which is
//! normally provided by the `std`.
//!
//! Note that this allocator serves alignments up to 8 bytes, the natural
//! alignment of every primitive type on the supported targets. Requests with
//! a stricter alignment fail, i.e. return a null pointer.
//!
//! # Implementation
//! The heap is a gapless sequence of blocks, each led by a 4-byte header
//! word holding the block size and three flag bits. A freshly initialized
//! heap contains the free-list slot array, two sentinel blocks and nothing
//! else; memory is claimed from the backing region in chunks as needed.
//!
//! The distinguishing feature is the *free-block index*. Freed blocks are
//! filed by size into one of five slots:
//! ```text
//! slot 0: mini blocks (8 bytes), singly linked
//! slot 1: 16-byte blocks, doubly linked
//! slot 2: 24-byte blocks, doubly linked
//! slot 3: 32-byte blocks, doubly linked
//! slot 4: root of a search tree keyed by size, for everything larger
//! ```
//! An allocation looks in the exact-size bin first and falls back to a
//! best-fit descent through the tree. Oversized hits are split and the tail
//! is re-indexed. Releases merge the block with free physical neighbors
//! before re-indexing, so fragmentation cannot accumulate between two frees.
//!
//! Two tricks keep the per-block overhead at 4 bytes:
//! 1. Allocated blocks carry no footer. Free blocks mirror their size at
//!    their end so a successor can walk backwards; for allocated blocks
//!    that information is unnecessary, and the successor's header flags
//!    (`prev_alloc`, `prev_small`) record what little is still needed.
//! 2. List links are 4-byte offsets from the heap base rather than full
//!    pointers, which is what allows a free block of 8 bytes to exist (a
//!    header plus one link).
//!
//! The price is bookkeeping discipline: whichever operation changes a
//! block's allocation state must also patch the flags of the block after
//! it. In debug builds an extensive checker re-validates the whole heap --
//! sentinels, block chain, footers, flags, lists, tree shape and the free
//! block population -- on every entry point, so a violation panics close to
//! its cause instead of corrupting the heap silently.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

mod arena;
mod heap;

use arena::Arena;
use heap::Heap;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

/// The maximum alignment the allocator can serve.
const MAX_ALIGN: usize = 8;

/// A memory allocator with an indexed free list.
///
/// This is the core type of this crate: it is an allocator with a predefined
/// backing memory size. Therefore the heap memory usage is statically
/// limited to an upper value, which also helps to prevent issues with
/// heap/stack-smashes, as the heap is counted to the static memory (e.g.
/// `.data`/`.bss`-sections). Such a smash might still happen though, if the
/// stack pointer grows into the heap, but the heap cannot grow into the
/// stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary
/// crate you're developing. The memory size of the heap is `4096` or 4K in
/// this example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: treealloc::Allocator<4096> = treealloc::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for
/// recommendations on the buffer size and general usage.
pub struct Allocator<const N: usize> {
    heap: spin::Mutex<Heap<Arena<N>>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is
    /// less than `64` or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= 64, "too small heap memory: minimum size is 64");
        assert!(N % 8 == 0, "memory size has to be divisible by 8");
        Self {
            heap: spin::Mutex::new(Heap::new(Arena::new())),
        }
    }
}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return null_mut();
        }
        let mut heap = self.heap.lock();
        match heap.alloc(layout.size()) {
            Some(payload) => heap.payload_ptr(payload),
            None => null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return null_mut();
        }
        let mut heap = self.heap.lock();
        match heap.alloc_zeroed(layout.size(), 1) {
            Some(payload) => heap.payload_ptr(payload),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        let mut heap = self.heap.lock();
        match heap.payload_offset(ptr) {
            Some(payload) => heap.release(payload),
            None => debug_assert!(false, "deallocated pointer does not belong to this heap"),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return null_mut();
        }
        let mut heap = self.heap.lock();
        let payload = match heap.payload_offset(ptr) {
            Some(payload) => payload,
            None => return null_mut(),
        };
        match heap.reallocate(payload, new_size) {
            Some(moved) => heap.payload_ptr(moved),
            None => null_mut(),
        }
    }
}

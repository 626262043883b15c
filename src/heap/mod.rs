//! The allocator core.
//!
//! A [`Heap`] manages a monotonically growing region of memory obtained from
//! a [`HeapSource`] and serves arbitrary allocate/release/reallocate requests
//! from it. All bookkeeping lives inside the heap itself:
//!
//! ```text
//! +--------------------+----------+----------+----------------+----------+
//! | 5 free-list slots  | prologue | prologue |  ... blocks ...| epilogue |
//! | (4 bytes each)     |  header  |  footer  |                |  header  |
//! +--------------------+----------+----------+----------------+----------+
//! 0                   20         24         28                 limit-4
//! ```
//!
//! The prologue (an 8-byte allocated block) and the epilogue (a zero-sized
//! allocated header rewritten at the high-water mark on every extension) are
//! permanent sentinels: walks terminate on them and coalescing never reaches
//! past them. Between the sentinels, the heap is a gapless sequence of
//! blocks. Free ones are indexed by size in the slot array, allocated ones
//! are owned by the client until released.
//!
//! The allocation policy is best-fit with splitting: the smallest indexed
//! block that satisfies the request is used, and any tail of at least 8
//! bytes is carved off and re-indexed. Released blocks are merged with free
//! physical neighbors before they are indexed again, so no two adjacent free
//! blocks ever exist at rest.

pub(crate) mod block;
#[cfg(any(debug_assertions, test))]
mod check;
mod index;

use crate::arena::{HeapSource, OutOfMemory};
use block::{Block, Header};

/// Natural word size: drives alignment, the bin step and block granularity.
pub(crate) const WORD: usize = 8;
/// Size of a header or footer word.
pub(crate) const HEADER_SIZE: usize = 4;
/// The smallest block: a header plus a 4-byte successor link.
pub(crate) const MIN_BLOCK: usize = 8;
/// Largest size kept in the exact-size bins; everything above is tree-kept.
pub(crate) const THRESHOLD: usize = 32;
/// Exact-size bins plus the tree-root slot.
pub(crate) const BIN_COUNT: usize = 5;
/// Preferred grant for a heap extension, to amortize extension costs.
/// Requests are padded up to this size while the backing memory can still
/// grant it; see [`Heap::extend_for`].
pub(crate) const CHUNK_SIZE: usize = 256;

/// Heap offset of the prologue block header.
pub(crate) const PROLOGUE: u32 = (BIN_COUNT * HEADER_SIZE) as u32;
/// Heap offset of the first ordinary block header.
pub(crate) const FIRST_BLOCK: u32 = PROLOGUE + WORD as u32;
/// Bytes claimed by the initial layout: slot array, prologue pair, epilogue.
const INIT_BYTES: usize = PROLOGUE as usize + WORD + HEADER_SIZE;

/// A best-fit heap over some backing memory.
///
/// All client-visible locations are *payload offsets*: byte offsets from the
/// heap base pointing directly at usable memory. `0` doubles as the null
/// payload, since the first possible payload sits far behind the slot array.
///
/// The heap is single-threaded; interior mutability and locking are the
/// concern of the front-end (see [`Allocator`](crate::Allocator)).
pub struct Heap<S: HeapSource> {
    source: S,
}

impl<S: HeapSource> Heap<S> {
    pub const fn new(source: S) -> Self {
        Self { source }
    }

    /// Allocate `size` bytes and return the payload offset.
    ///
    /// Returns `None` for zero-sized requests and when the backing memory is
    /// exhausted. A failed allocation leaves the heap untouched.
    pub fn alloc(&mut self, size: usize) -> Option<u32> {
        if size == 0 {
            return None;
        }
        self.ensure_init().ok()?;
        self.debug_check();

        let adjusted = Self::adjusted_size(size)?;
        let block = match self.find_fit(adjusted) {
            Some(block) => block,
            None => self.extend_for(adjusted).ok()?,
        };
        self.place(block, adjusted);
        Some(block.payload())
    }

    /// Allocate a zeroed array of `count` elements of `unit` bytes each.
    ///
    /// Returns `None` if the total size overflows or the allocation fails.
    pub fn alloc_zeroed(&mut self, count: usize, unit: usize) -> Option<u32> {
        let bytes = count.checked_mul(unit)?;
        let payload = self.alloc(bytes)?;
        self.fill_payload(payload, 0, bytes);
        Some(payload)
    }

    /// Return an allocation to the heap.
    ///
    /// A null (zero) payload is ignored. Offsets that cannot belong to this
    /// heap panic in debug builds and are silently ignored in release
    /// builds.
    pub fn release(&mut self, payload: u32) {
        if payload == 0 {
            return;
        }
        if !self.plausible_payload(payload) {
            debug_assert!(false, "released pointer outside the heap: {payload}");
            return;
        }
        self.debug_check();

        let block = Block::of_payload(payload);
        let header = self.header(block);
        debug_assert!(header.is_alloc(), "double free of offset {payload}");
        if !header.is_alloc() {
            return;
        }

        self.set_header(
            block,
            Header::new(header.size(), false, header.prev_alloc(), header.prev_small()),
        );
        self.write_free_footer(block);
        let block = self.coalesce(block);
        self.index_insert(block);
    }

    /// Resize an allocation, preserving its payload prefix.
    ///
    /// Shrinking returns the same offset without splitting. Growth first
    /// tries to swallow a free physically-next block in place; only when
    /// that fails is a fresh block allocated, the payload copied over and
    /// the old block released. If the fresh allocation fails, the old block
    /// stays valid and `None` is returned.
    pub fn reallocate(&mut self, payload: u32, new_size: usize) -> Option<u32> {
        if new_size == 0 {
            self.release(payload);
            return None;
        }
        if payload == 0 {
            return self.alloc(new_size);
        }
        if !self.plausible_payload(payload) {
            debug_assert!(false, "reallocated pointer outside the heap: {payload}");
            return None;
        }
        self.debug_check();

        let block = Block::of_payload(payload);
        let old_size = self.size_of(block);
        let adjusted = Self::adjusted_size(new_size)?;

        if adjusted <= old_size {
            // the block is already big enough; the spare tail is not split off
            return Some(payload);
        }

        let next = self.next(block);
        let next_header = self.header(next);
        if !next_header.is_alloc() && old_size + next_header.size() >= adjusted {
            // grow in place by swallowing the free neighbor
            self.index_delete(next);
            let merged = old_size + next_header.size();
            let header = self.header(block);
            self.set_header(
                block,
                Header::new(merged, true, header.prev_alloc(), header.prev_small()),
            );
            self.place(block, adjusted);
            return Some(payload);
        }

        let fresh = self.alloc(new_size)?;
        self.copy_payload(payload, fresh, old_size - HEADER_SIZE);
        self.release(payload);
        Some(fresh)
    }

    /// A raw pointer to the payload at the given offset.
    pub fn payload_ptr(&mut self, payload: u32) -> *mut u8 {
        debug_assert!((payload as usize) < self.source.limit());
        // SAFETY: the offset is inside the arena object handed out by the
        // source, so the pointer arithmetic stays in bounds.
        unsafe { self.source.base_mut().add(payload as usize) }
    }

    /// Translate a pointer handed out earlier back into a payload offset.
    ///
    /// Returns `None` for pointers that do not point into the heap.
    pub fn payload_offset(&self, ptr: *const u8) -> Option<u32> {
        let offset = (ptr as usize).checked_sub(self.source.base() as usize)?;
        (offset < self.source.limit()).then(|| offset as u32)
    }

    /// Claim the initial bytes and write the slot array and sentinels.
    fn ensure_init(&mut self) -> Result<(), OutOfMemory> {
        if self.source.limit() != 0 {
            return Ok(());
        }
        let base = self.source.extend(INIT_BYTES)?;
        debug_assert_eq!(base, 0);

        for bin in 0..BIN_COUNT {
            self.set_slot(bin, None);
        }
        let sentinel = Header::new(WORD, true, true, false);
        self.set_header(Block(PROLOGUE), sentinel);
        self.write_u32(PROLOGUE + HEADER_SIZE as u32, sentinel.raw());
        // the initial epilogue records the prologue before it: allocated and
        // of minimum size
        self.set_header(Block(FIRST_BLOCK), Header::new(0, true, true, true));
        Ok(())
    }

    /// Round a requested payload size up to a legal block size.
    fn adjusted_size(size: usize) -> Option<usize> {
        if size <= HEADER_SIZE {
            Some(MIN_BLOCK)
        } else {
            let padded = size.checked_add(HEADER_SIZE + WORD - 1)?;
            Some(padded & !(WORD - 1))
        }
    }

    /// Whether an offset could plausibly be a payload this heap handed out.
    fn plausible_payload(&self, payload: u32) -> bool {
        payload as usize % WORD == 0
            && payload >= FIRST_BLOCK + HEADER_SIZE as u32
            && (payload as usize) < self.source.limit()
    }

    /// Grow the heap for a request of `adjusted` bytes.
    ///
    /// Extensions are padded up to [`CHUNK_SIZE`] to amortize their cost. A
    /// refused padded grant is retried with the exact size, so a backing
    /// memory smaller than one chunk can still serve everything that fits
    /// into it.
    fn extend_for(&mut self, adjusted: usize) -> Result<Block, OutOfMemory> {
        if adjusted >= CHUNK_SIZE {
            return self.extend_heap(adjusted);
        }
        self.extend_heap(CHUNK_SIZE)
            .or_else(|_| self.extend_heap(adjusted))
    }

    /// Grow the heap and return the (coalesced, indexed) new free block.
    fn extend_heap(&mut self, bytes: usize) -> Result<Block, OutOfMemory> {
        let bytes = bytes.checked_add(WORD - 1).ok_or(OutOfMemory)? & !(WORD - 1);
        let region = self.source.extend(bytes)?;

        // the old epilogue header becomes the new free block's header,
        // keeping its record of the block before the old high-water mark
        let block = Block(region as u32 - HEADER_SIZE as u32);
        let old = self.header(block);
        debug_assert_eq!(old.size(), 0);
        self.set_header(block, Header::new(bytes, false, old.prev_alloc(), old.prev_small()));
        self.write_free_footer(block);

        let epilogue = self.next(block);
        self.set_header(epilogue, Header::new(0, true, false, bytes == MIN_BLOCK));

        let block = self.coalesce(block);
        self.index_insert(block);
        Ok(block)
    }

    /// Carve an allocation of `adjusted` bytes out of `block`.
    ///
    /// The block is removed from the index if it is still free (the
    /// reallocate fast path re-places an already-allocated block). A tail of
    /// at least the minimum block size is split off and re-indexed.
    fn place(&mut self, block: Block, adjusted: usize) {
        let header = self.header(block);
        let total = header.size();
        debug_assert!(adjusted <= total);

        if !header.is_alloc() {
            self.index_delete(block);
        }

        let remain = total - adjusted;
        if remain >= MIN_BLOCK {
            self.set_header(
                block,
                Header::new(adjusted, true, header.prev_alloc(), header.prev_small()),
            );
            let remainder = self.next(block);
            self.set_header(remainder, Header::new(remain, false, true, adjusted == MIN_BLOCK));
            self.write_free_footer(remainder);
            self.index_insert(remainder);
        } else {
            self.set_header(
                block,
                Header::new(total, true, header.prev_alloc(), header.prev_small()),
            );
            let next = self.next(block);
            let next_header = self.header(next);
            self.set_header(
                next,
                Header::new(next_header.size(), next_header.is_alloc(), true, total == MIN_BLOCK),
            );
        }
    }

    /// Merge a freed block with its free physical neighbors.
    ///
    /// The four prev/next states collapse to one resulting free block whose
    /// header (and footer, unless mini) is rewritten here. The caller is
    /// responsible for inserting the result into the index, which also fixes
    /// up the following block's flags.
    fn coalesce(&mut self, block: Block) -> Block {
        let header = self.header(block);
        debug_assert!(!header.is_alloc());
        let next = self.next(block);
        let next_header = self.header(next);
        let prev_free = !header.prev_alloc();
        let next_free = !next_header.is_alloc();

        match (prev_free, next_free) {
            (false, false) => block,
            (false, true) => {
                self.index_delete(next);
                let merged = header.size() + next_header.size();
                self.set_header(block, Header::new(merged, false, true, header.prev_small()));
                self.write_free_footer(block);
                block
            }
            (true, false) => {
                let prev = self.prev(block);
                self.index_delete(prev);
                let prev_header = self.header(prev);
                let merged = prev_header.size() + header.size();
                self.set_header(
                    prev,
                    Header::new(merged, false, prev_header.prev_alloc(), prev_header.prev_small()),
                );
                self.write_free_footer(prev);
                prev
            }
            (true, true) => {
                let prev = self.prev(block);
                self.index_delete(next);
                self.index_delete(prev);
                let prev_header = self.header(prev);
                let merged = prev_header.size() + header.size() + next_header.size();
                self.set_header(
                    prev,
                    Header::new(merged, false, prev_header.prev_alloc(), prev_header.prev_small()),
                );
                self.write_free_footer(prev);
                prev
            }
        }
    }

    fn fill_payload(&mut self, payload: u32, value: u8, bytes: usize) {
        debug_assert!(self.in_bounds(payload, bytes));
        // SAFETY: the range lies inside the payload of an allocated block
        // (asserted to be in heap bounds above).
        unsafe {
            core::ptr::write_bytes(self.source.base_mut().add(payload as usize), value, bytes);
        }
    }

    fn copy_payload(&mut self, from: u32, to: u32, bytes: usize) {
        debug_assert!(self.in_bounds(from, bytes) && self.in_bounds(to, bytes));
        let base = self.source.base_mut();
        // SAFETY: both ranges lie inside the heap and belong to two distinct
        // live blocks, so they cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(base.add(from as usize), base.add(to as usize), bytes);
        }
    }

    /// Run the invariant checker on every public entry in debug builds.
    #[inline]
    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        if let Err(error) = self.check() {
            panic!("heap invariant violated: {error:?}");
        }
    }
}

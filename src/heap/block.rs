//! The block encoding: header words, footers and physical navigation.
//!
//! A block is a run of heap bytes starting with a 4-byte header word. The
//! header packs the block size (a multiple of 8, so the low three bits are
//! free) together with three flags:
//!
//! ```text
//! 31                                    3   2   1   0
//! +-------------------------------------+---+---+---+
//! |              block size             | S | P | A |
//! +-------------------------------------+---+---+---+
//! A = this block is allocated
//! P = the physically preceding block is allocated
//! S = the physically preceding block is a mini block (size 8)
//! ```
//!
//! Allocated blocks carry no footer; the bytes a footer would occupy belong
//! to the payload. Free blocks larger than a mini block mirror their size in
//! a footer word at the very end, which is what lets the *next* block walk
//! backwards over them. Mini blocks cannot hold a footer either, hence the
//! `S`-flag: it tells the successor to step back a fixed 8 bytes instead of
//! reading a footer.
//!
//! Everything in here addresses the heap through offsets from the arena
//! base. The two reader/writer pairs ([`Heap::read_u32`] and friends) are the
//! only places where offsets are turned into memory accesses, and they
//! assert that the access stays inside the grown part of the heap.

use super::{Heap, HEADER_SIZE, MIN_BLOCK, WORD};
use crate::arena::HeapSource;

/// A block, identified by the heap offset of its header word.
///
/// The offset is always congruent 4 modulo 8, so that the payload starting
/// right after the header is 8-byte aligned. Offset `0` addresses the free
/// list slot array and is never a valid block, which makes the raw value `0`
/// usable as the null link in the free-block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(pub(crate) u32);

impl Block {
    /// The heap offset of this block's payload.
    pub(crate) fn payload(self) -> u32 {
        self.0 + HEADER_SIZE as u32
    }

    /// The block owning the payload at the given offset.
    pub(crate) fn of_payload(payload: u32) -> Self {
        Self(payload - HEADER_SIZE as u32)
    }

    /// Encode an optional block as a 4-byte link word (`0` = none).
    pub(crate) fn link(block: Option<Self>) -> u32 {
        block.map_or(0, |block| block.0)
    }

    /// Decode a 4-byte link word.
    pub(crate) fn from_link(raw: u32) -> Option<Self> {
        (raw != 0).then(|| Self(raw))
    }

    /// Encode an optional block as an 8-byte tree link word (`0` = none).
    pub(crate) fn wide_link(block: Option<Self>) -> u64 {
        block.map_or(0, |block| u64::from(block.0))
    }

    /// Decode an 8-byte tree link word.
    pub(crate) fn from_wide_link(raw: u64) -> Option<Self> {
        (raw != 0).then(|| Self(raw as u32))
    }
}

/// A decoded header (or footer) word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(u32);

impl Header {
    const ALLOC: u32 = 1 << 0;
    const PREV_ALLOC: u32 = 1 << 1;
    const PREV_SMALL: u32 = 1 << 2;
    const SIZE_MASK: u32 = !0x7;

    pub(crate) fn new(size: usize, alloc: bool, prev_alloc: bool, prev_small: bool) -> Self {
        debug_assert!(size % WORD == 0, "block sizes are multiples of 8");
        debug_assert!(size <= u32::MAX as usize);

        let mut word = size as u32;
        if alloc {
            word |= Self::ALLOC;
        }
        if prev_alloc {
            word |= Self::PREV_ALLOC;
        }
        if prev_small {
            word |= Self::PREV_SMALL;
        }
        Self(word)
    }

    pub(crate) fn from_raw(word: u32) -> Self {
        Self(word)
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn size(self) -> usize {
        (self.0 & Self::SIZE_MASK) as usize
    }

    pub(crate) fn is_alloc(self) -> bool {
        self.0 & Self::ALLOC != 0
    }

    pub(crate) fn prev_alloc(self) -> bool {
        self.0 & Self::PREV_ALLOC != 0
    }

    pub(crate) fn prev_small(self) -> bool {
        self.0 & Self::PREV_SMALL != 0
    }
}

impl<S: HeapSource> Heap<S> {
    /// Whether `len` bytes starting at offset `at` lie inside the heap.
    pub(crate) fn in_bounds(&self, at: u32, len: usize) -> bool {
        (at as usize)
            .checked_add(len)
            .map_or(false, |end| end <= self.source.limit())
    }

    /// Read a 4-byte word at a heap offset.
    pub(crate) fn read_u32(&self, at: u32) -> u32 {
        debug_assert!(self.in_bounds(at, 4), "word read outside the heap: {at}");
        // SAFETY: the offset is inside the grown part of the arena (asserted
        // above in debug builds, guaranteed by the heap layout otherwise), so
        // the computed pointer stays within the single allocated object the
        // arena hands out. Unaligned reads are used so no alignment
        // obligation exists.
        unsafe { self.source.base().add(at as usize).cast::<u32>().read_unaligned() }
    }

    /// Write a 4-byte word at a heap offset.
    pub(crate) fn write_u32(&mut self, at: u32, word: u32) {
        debug_assert!(self.in_bounds(at, 4), "word write outside the heap: {at}");
        // SAFETY: see `read_u32`.
        unsafe {
            self.source
                .base_mut()
                .add(at as usize)
                .cast::<u32>()
                .write_unaligned(word);
        }
    }

    /// Read an 8-byte word at a heap offset.
    pub(crate) fn read_u64(&self, at: u32) -> u64 {
        debug_assert!(self.in_bounds(at, 8), "word read outside the heap: {at}");
        // SAFETY: see `read_u32`.
        unsafe { self.source.base().add(at as usize).cast::<u64>().read_unaligned() }
    }

    /// Write an 8-byte word at a heap offset.
    pub(crate) fn write_u64(&mut self, at: u32, word: u64) {
        debug_assert!(self.in_bounds(at, 8), "word write outside the heap: {at}");
        // SAFETY: see `read_u32`.
        unsafe {
            self.source
                .base_mut()
                .add(at as usize)
                .cast::<u64>()
                .write_unaligned(word);
        }
    }

    pub(crate) fn header(&self, block: Block) -> Header {
        Header::from_raw(self.read_u32(block.0))
    }

    pub(crate) fn set_header(&mut self, block: Block, header: Header) {
        self.write_u32(block.0, header.raw());
    }

    pub(crate) fn size_of(&self, block: Block) -> usize {
        self.header(block).size()
    }

    /// Mirror the header into the footer word of a free block.
    ///
    /// Mini blocks have no room for a footer; their successor navigates via
    /// the `prev_small` flag instead, so nothing is written for them.
    pub(crate) fn write_free_footer(&mut self, block: Block) {
        let size = self.size_of(block);
        debug_assert!(!self.header(block).is_alloc());
        if size > MIN_BLOCK {
            let footer = Header::new(size, false, false, false);
            self.write_u32(block.0 + (size - HEADER_SIZE) as u32, footer.raw());
        }
    }

    /// Read the footer word of a free block larger than a mini block.
    ///
    /// Regular operation trusts the footers it wrote; only the invariant
    /// checker reads them back.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn footer(&self, block: Block) -> Header {
        let size = self.size_of(block);
        debug_assert!(size > MIN_BLOCK, "mini blocks carry no footer");
        Header::from_raw(self.read_u32(block.0 + (size - HEADER_SIZE) as u32))
    }

    /// The physically next block.
    pub(crate) fn next(&self, block: Block) -> Block {
        Block(block.0 + self.size_of(block) as u32)
    }

    /// The physically preceding block.
    ///
    /// Only meaningful while the preceding block is free: an allocated
    /// predecessor has no footer to step over. The mini case is the one
    /// consumer of the `prev_small` flag.
    pub(crate) fn prev(&self, block: Block) -> Block {
        debug_assert!(
            !self.header(block).prev_alloc(),
            "cannot navigate over an allocated predecessor"
        );
        if self.header(block).prev_small() {
            Block(block.0 - MIN_BLOCK as u32)
        } else {
            let footer = Header::from_raw(self.read_u32(block.0 - HEADER_SIZE as u32));
            Block(block.0 - footer.size() as u32)
        }
    }

    // Free-list link fields, stored as 4-byte offsets in the first payload
    // bytes of a free block. Mini blocks only have the successor.

    pub(crate) fn succ(&self, block: Block) -> Option<Block> {
        Block::from_link(self.read_u32(block.payload()))
    }

    pub(crate) fn set_succ(&mut self, block: Block, to: Option<Block>) {
        self.write_u32(block.payload(), Block::link(to));
    }

    pub(crate) fn pred(&self, block: Block) -> Option<Block> {
        Block::from_link(self.read_u32(block.payload() + 4))
    }

    pub(crate) fn set_pred(&mut self, block: Block, to: Option<Block>) {
        self.write_u32(block.payload() + 4, Block::link(to));
    }

    // Tree link fields of large free blocks. These have 8 bytes each, after
    // the successor/predecessor pair.

    pub(crate) fn left(&self, block: Block) -> Option<Block> {
        Block::from_wide_link(self.read_u64(block.payload() + 8))
    }

    pub(crate) fn set_left(&mut self, block: Block, to: Option<Block>) {
        self.write_u64(block.payload() + 8, Block::wide_link(to));
    }

    pub(crate) fn right(&self, block: Block) -> Option<Block> {
        Block::from_wide_link(self.read_u64(block.payload() + 16))
    }

    pub(crate) fn set_right(&mut self, block: Block, to: Option<Block>) {
        self.write_u64(block.payload() + 16, Block::wide_link(to));
    }

    pub(crate) fn parent(&self, block: Block) -> Option<Block> {
        Block::from_wide_link(self.read_u64(block.payload() + 24))
    }

    pub(crate) fn set_parent(&mut self, block: Block, to: Option<Block>) {
        self.write_u64(block.payload() + 24, Block::wide_link(to));
    }
}

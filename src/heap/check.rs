//! The heap invariant checker.
//!
//! [`Heap::check`] cross-validates the physical block sequence against the
//! free-block index and reports the first violated invariant. Debug builds
//! run it on every public entry point; release builds compile this whole
//! module out.

use super::block::{Block, Header};
use super::index::{bin_of, TREE_BIN};
use super::{Heap, FIRST_BLOCK, HEADER_SIZE, MIN_BLOCK, PROLOGUE, WORD};
use crate::arena::HeapSource;

/// The first invariant violation found by [`Heap::check`].
///
/// Offsets name the block *header* at fault, which is usually enough to
/// find the misbehaving operation in a debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckError {
    /// The prologue sentinel is not an allocated 8-byte block anymore.
    BadPrologue,
    /// The block walk did not end in an allocated, zero-sized header at the
    /// heap's high-water mark.
    BadEpilogue,
    /// A block header is not at an offset congruent 4 modulo 8.
    MisalignedBlock { offset: u32 },
    /// A block size is below the minimum, not a multiple of 8 or runs past
    /// the end of the heap.
    BadBlockSize { offset: u32 },
    /// A free block's footer does not mirror its header.
    FooterMismatch { offset: u32 },
    /// A block's `prev_alloc` flag contradicts its predecessor's state.
    PrevAllocMismatch { offset: u32 },
    /// A block's `prev_small` flag contradicts its predecessor's size.
    PrevSmallMismatch { offset: u32 },
    /// Two physically adjacent blocks are both free.
    AdjacentFreeBlocks { offset: u32 },
    /// The index reaches a block whose header says it is allocated.
    IndexedBlockNotFree { offset: u32 },
    /// A listed block's size does not match the bin holding it.
    WrongBin { offset: u32 },
    /// A doubly linked list's neighbor links disagree.
    BrokenListLink { offset: u32 },
    /// The search tree is not strictly ordered by size.
    TreeOrderViolation { offset: u32 },
    /// A tree child does not point back at its parent.
    TreeParentMismatch { offset: u32 },
    /// A member of a tree node's duplicate list has a different size.
    TreeSizeMismatch { offset: u32 },
    /// The heap walk and the index disagree about the free block population.
    FreeCountMismatch { walked: usize, indexed: usize },
}

impl<S: HeapSource> Heap<S> {
    /// Verify every structural invariant of the heap and its index.
    pub(crate) fn check(&self) -> Result<(), CheckError> {
        if self.source.limit() == 0 {
            // nothing claimed yet, nothing to get wrong
            return Ok(());
        }

        self.check_prologue()?;
        let walked = self.check_blocks()?;
        let mut indexed = 0_usize;
        self.check_lists(walked, &mut indexed)?;
        if let Some(root) = self.tree_root() {
            if self.parent(root).is_some() {
                return Err(CheckError::TreeParentMismatch { offset: root.0 });
            }
            self.check_tree(root, 0, usize::MAX, walked, &mut indexed)?;
        }
        if walked != indexed {
            return Err(CheckError::FreeCountMismatch { walked, indexed });
        }
        Ok(())
    }

    fn check_prologue(&self) -> Result<(), CheckError> {
        let header = self.header(Block(PROLOGUE));
        let footer = Header::from_raw(self.read_u32(PROLOGUE + HEADER_SIZE as u32));
        if header.size() != WORD || !header.is_alloc() || footer.size() != WORD || !footer.is_alloc()
        {
            return Err(CheckError::BadPrologue);
        }
        Ok(())
    }

    /// Walk the physical block sequence and return the free block count.
    fn check_blocks(&self) -> Result<usize, CheckError> {
        let mut walked = 0_usize;
        // the prologue precedes the first block: allocated, minimum-sized
        let mut prev_alloc = true;
        let mut prev_size = WORD;
        let mut block = Block(FIRST_BLOCK);

        loop {
            if !self.in_bounds(block.0, HEADER_SIZE) {
                return Err(CheckError::BadEpilogue);
            }
            let header = self.header(block);

            // the preceding block's state must be mirrored here, epilogue
            // included
            if header.prev_alloc() != prev_alloc {
                return Err(CheckError::PrevAllocMismatch { offset: block.0 });
            }
            if header.prev_small() != (prev_size == MIN_BLOCK) {
                return Err(CheckError::PrevSmallMismatch { offset: block.0 });
            }
            if !header.is_alloc() && !prev_alloc {
                return Err(CheckError::AdjacentFreeBlocks { offset: block.0 });
            }

            if header.size() == 0 {
                if !header.is_alloc() || block.0 as usize + HEADER_SIZE != self.source.limit() {
                    return Err(CheckError::BadEpilogue);
                }
                return Ok(walked);
            }

            if block.0 as usize % WORD != HEADER_SIZE {
                return Err(CheckError::MisalignedBlock { offset: block.0 });
            }
            if header.size() < MIN_BLOCK
                || header.size() % WORD != 0
                || !self.in_bounds(block.0, header.size() + HEADER_SIZE)
            {
                return Err(CheckError::BadBlockSize { offset: block.0 });
            }

            if !header.is_alloc() {
                walked += 1;
                if header.size() > MIN_BLOCK {
                    let footer = self.footer(block);
                    if footer.size() != header.size() || footer.is_alloc() {
                        return Err(CheckError::FooterMismatch { offset: block.0 });
                    }
                }
            }

            prev_alloc = header.is_alloc();
            prev_size = header.size();
            block = self.next(block);
        }
    }

    fn check_lists(&self, walked: usize, indexed: &mut usize) -> Result<(), CheckError> {
        // bin 0: singly linked minis
        let mut cursor = self.slot(0);
        while let Some(node) = cursor {
            *indexed += 1;
            if *indexed > walked {
                // more index entries than free blocks exist: a cycle or a
                // stale link
                return Err(CheckError::FreeCountMismatch { walked, indexed: *indexed });
            }
            let header = self.header(node);
            if header.is_alloc() {
                return Err(CheckError::IndexedBlockNotFree { offset: node.0 });
            }
            if header.size() != MIN_BLOCK {
                return Err(CheckError::WrongBin { offset: node.0 });
            }
            cursor = self.succ(node);
        }

        // bins 1..: doubly linked exact sizes
        for bin in 1..TREE_BIN {
            let mut cursor = self.slot(bin);
            if let Some(head) = cursor {
                if self.pred(head).is_some() {
                    return Err(CheckError::BrokenListLink { offset: head.0 });
                }
            }
            while let Some(node) = cursor {
                *indexed += 1;
                if *indexed > walked {
                    return Err(CheckError::FreeCountMismatch { walked, indexed: *indexed });
                }
                let header = self.header(node);
                if header.is_alloc() {
                    return Err(CheckError::IndexedBlockNotFree { offset: node.0 });
                }
                if bin_of(header.size()) != bin {
                    return Err(CheckError::WrongBin { offset: node.0 });
                }
                if let Some(succ) = self.succ(node) {
                    if self.pred(succ) != Some(node) {
                        return Err(CheckError::BrokenListLink { offset: node.0 });
                    }
                }
                cursor = self.succ(node);
            }
        }
        Ok(())
    }

    /// Recursively verify the tree between exclusive size bounds.
    fn check_tree(
        &self,
        node: Block,
        lower: usize,
        upper: usize,
        walked: usize,
        indexed: &mut usize,
    ) -> Result<(), CheckError> {
        let size = self.size_of(node);
        if size <= lower || size >= upper {
            return Err(CheckError::TreeOrderViolation { offset: node.0 });
        }
        if bin_of(size) != TREE_BIN {
            return Err(CheckError::WrongBin { offset: node.0 });
        }

        // the duplicate-size list hanging off this tree position
        let mut cursor = Some(node);
        while let Some(member) = cursor {
            *indexed += 1;
            if *indexed > walked {
                return Err(CheckError::FreeCountMismatch { walked, indexed: *indexed });
            }
            let header = self.header(member);
            if header.is_alloc() {
                return Err(CheckError::IndexedBlockNotFree { offset: member.0 });
            }
            if header.size() != size {
                return Err(CheckError::TreeSizeMismatch { offset: member.0 });
            }
            if let Some(succ) = self.succ(member) {
                if self.pred(succ) != Some(member) {
                    return Err(CheckError::BrokenListLink { offset: member.0 });
                }
            }
            cursor = self.succ(member);
        }

        if let Some(left) = self.left(node) {
            if self.parent(left) != Some(node) {
                return Err(CheckError::TreeParentMismatch { offset: left.0 });
            }
            self.check_tree(left, lower, size, walked, indexed)?;
        }
        if let Some(right) = self.right(node) {
            if self.parent(right) != Some(node) {
                return Err(CheckError::TreeParentMismatch { offset: right.0 });
            }
            self.check_tree(right, size, upper, walked, indexed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl<S: HeapSource> Heap<S> {
    /// Count the free blocks in the physical sequence.
    pub(crate) fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut block = Block(FIRST_BLOCK);
        while self.size_of(block) != 0 {
            if !self.header(block).is_alloc() {
                count += 1;
            }
            block = self.next(block);
        }
        count
    }

    /// Count the blocks reachable through the tree, duplicates included.
    pub(crate) fn tree_block_count(&self) -> usize {
        fn count<S: HeapSource>(heap: &Heap<S>, node: Option<Block>) -> usize {
            let Some(node) = node else { return 0 };
            let mut members = 0;
            let mut cursor = Some(node);
            while let Some(member) = cursor {
                members += 1;
                cursor = heap.succ(member);
            }
            members + count(heap, heap.left(node)) + count(heap, heap.right(node))
        }
        count(self, self.tree_root())
    }

    /// Length of a segregated list.
    pub(crate) fn bin_len(&self, bin: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.slot(bin);
        while let Some(node) = cursor {
            count += 1;
            cursor = self.succ(node);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::super::block::{Block, Header};
    use super::super::Heap;
    use super::CheckError;
    use crate::arena::Arena;

    fn populated_heap() -> (Heap<Arena<4096>>, u32, u32) {
        let mut heap = Heap::new(Arena::new());
        let a = heap.alloc(48).unwrap();
        let b = heap.alloc(48).unwrap();
        heap.release(a);
        (heap, a, b)
    }

    #[test]
    fn a_consistent_heap_passes() {
        let (heap, _, _) = populated_heap();
        assert_eq!(heap.check(), Ok(()));
    }

    #[test]
    fn a_damaged_prologue_is_reported() {
        let (mut heap, _, _) = populated_heap();
        heap.write_u32(super::PROLOGUE, 0);
        assert_eq!(heap.check(), Err(CheckError::BadPrologue));
    }

    #[test]
    fn a_hidden_free_block_is_reported() {
        let (mut heap, a, _) = populated_heap();
        // flip the free block to "allocated" behind the index's back
        let block = Block::of_payload(a);
        let header = heap.header(block);
        heap.set_header(
            block,
            Header::new(header.size(), true, header.prev_alloc(), header.prev_small()),
        );
        // the next block still records a free predecessor
        assert_eq!(
            heap.check(),
            Err(CheckError::PrevAllocMismatch { offset: block.0 + header.size() as u32 })
        );
    }

    #[test]
    fn a_torn_footer_is_reported() {
        let (mut heap, a, _) = populated_heap();
        let block = Block::of_payload(a);
        let footer_at = block.0 + heap.size_of(block) as u32 - 4;
        heap.write_u32(footer_at, Header::new(1024, false, false, false).raw());
        assert_eq!(heap.check(), Err(CheckError::FooterMismatch { offset: block.0 }));
    }

    #[test]
    fn a_stale_index_entry_is_reported() {
        let (mut heap, a, b) = populated_heap();
        // re-allocating the freed block must empty its bin; simulate a buggy
        // path that forgot the index delete by re-linking the slot
        let _ = b;
        let block = Block::of_payload(a);
        let bin = super::bin_of(heap.size_of(block));
        let fit = heap.alloc(48).unwrap();
        assert_eq!(fit, a);
        heap.set_slot(bin, Some(block));
        assert!(heap.check().is_err());
    }
}

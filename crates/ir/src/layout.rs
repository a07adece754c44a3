//! This module contains function layout information including block order and
//! instruction order.
use cranelift_entity::SecondaryMap;

use super::{BlockId, InstId};

#[derive(Debug, Clone, Default)]
pub struct Layout {
    blocks: SecondaryMap<BlockId, BlockNode>,
    insts: SecondaryMap<InstId, InstNode>,
    entry_block: Option<BlockId>,
    last_block: Option<BlockId>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.entry_block
    }

    pub fn last_block(&self) -> Option<BlockId> {
        self.last_block
    }

    pub fn is_block_empty(&self, block: BlockId) -> bool {
        self.first_inst_of(block).is_none()
    }

    pub fn prev_block_of(&self, block: BlockId) -> Option<BlockId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].prev
    }

    pub fn next_block_of(&self, block: BlockId) -> Option<BlockId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].next
    }

    pub fn is_block_inserted(&self, block: BlockId) -> bool {
        Some(block) == self.entry_block || self.blocks[block] != BlockNode::default()
    }

    pub fn first_inst_of(&self, block: BlockId) -> Option<InstId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].first_inst
    }

    pub fn last_inst_of(&self, block: BlockId) -> Option<InstId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].last_inst
    }

    pub fn prev_inst_of(&self, inst: InstId) -> Option<InstId> {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].prev
    }

    pub fn next_inst_of(&self, inst: InstId) -> Option<InstId> {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].next
    }

    /// Returns the block containing `inst`.
    ///
    /// # Panic
    /// Panics if `inst` is not inserted.
    pub fn inst_block(&self, inst: InstId) -> BlockId {
        match self.insts[inst].block {
            Some(block) => block,
            None => panic!("{inst} is not inserted"),
        }
    }

    pub fn is_inst_inserted(&self, inst: InstId) -> bool {
        self.insts[inst].block.is_some()
    }

    /// Returns `true` if `a` comes strictly before `b` in the same block.
    pub fn is_before_in_block(&self, a: InstId, b: InstId) -> bool {
        debug_assert_eq!(self.inst_block(a), self.inst_block(b));
        let mut next = self.next_inst_of(a);
        while let Some(inst) = next {
            if inst == b {
                return true;
            }
            next = self.next_inst_of(inst);
        }
        false
    }

    pub fn iter_block(&self) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::successors(self.entry_block, |&block| self.blocks[block].next)
    }

    pub fn iter_inst(&self, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
        debug_assert!(self.is_block_inserted(block));
        std::iter::successors(self.blocks[block].first_inst, |&inst| self.insts[inst].next)
    }

    pub fn iter_inst_rev(&self, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
        debug_assert!(self.is_block_inserted(block));
        std::iter::successors(self.blocks[block].last_inst, |&inst| self.insts[inst].prev)
    }

    pub fn append_block(&mut self, block: BlockId) {
        debug_assert!(!self.is_block_inserted(block));
        match self.last_block {
            Some(last) => self.link_block(block, Some(last), None),
            None => {
                self.blocks[block] = BlockNode::default();
                self.entry_block = Some(block);
                self.last_block = Some(block);
            }
        }
    }

    pub fn insert_block_before(&mut self, block: BlockId, before: BlockId) {
        debug_assert!(self.is_block_inserted(before));
        debug_assert!(!self.is_block_inserted(block));
        let prev = self.blocks[before].prev;
        self.link_block(block, prev, Some(before));
    }

    pub fn insert_block_after(&mut self, block: BlockId, after: BlockId) {
        debug_assert!(self.is_block_inserted(after));
        debug_assert!(!self.is_block_inserted(block));
        let next = self.blocks[after].next;
        self.link_block(block, Some(after), next);
    }

    pub fn remove_block(&mut self, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));

        let BlockNode { prev, next, .. } = self.blocks[block];
        match prev {
            Some(prev) => self.blocks[prev].next = next,
            None => self.entry_block = next,
        }
        match next {
            Some(next) => self.blocks[next].prev = prev,
            None => self.last_block = prev,
        }

        self.blocks[block] = BlockNode::default();
    }

    pub fn append_inst(&mut self, inst: InstId, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));
        let last = self.blocks[block].last_inst;
        self.link_inst(inst, block, last, None);
    }

    pub fn prepend_inst(&mut self, inst: InstId, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));
        let first = self.blocks[block].first_inst;
        self.link_inst(inst, block, None, first);
    }

    pub fn insert_inst_before(&mut self, inst: InstId, before: InstId) {
        debug_assert!(self.is_inst_inserted(before));
        let InstNode { block, prev, .. } = self.insts[before];
        let block = block.unwrap_or_else(|| unreachable!());
        self.link_inst(inst, block, prev, Some(before));
    }

    pub fn insert_inst_after(&mut self, inst: InstId, after: InstId) {
        debug_assert!(self.is_inst_inserted(after));
        let InstNode { block, next, .. } = self.insts[after];
        let block = block.unwrap_or_else(|| unreachable!());
        self.link_inst(inst, block, Some(after), next);
    }

    /// Remove instruction from the layout.
    pub fn remove_inst(&mut self, inst: InstId) {
        let InstNode { block, prev, next } = self.insts[inst];
        let block = block.unwrap_or_else(|| panic!("{inst} is not inserted"));

        match prev {
            Some(prev) => self.insts[prev].next = next,
            None => self.blocks[block].first_inst = next,
        }
        match next {
            Some(next) => self.insts[next].prev = prev,
            None => self.blocks[block].last_inst = prev,
        }

        self.insts[inst] = InstNode::default();
    }

    fn link_block(&mut self, block: BlockId, prev: Option<BlockId>, next: Option<BlockId>) {
        match prev {
            Some(prev) => self.blocks[prev].next = Some(block),
            None => self.entry_block = Some(block),
        }
        match next {
            Some(next) => self.blocks[next].prev = Some(block),
            None => self.last_block = Some(block),
        }

        self.blocks[block] = BlockNode {
            prev,
            next,
            first_inst: None,
            last_inst: None,
        };
    }

    fn link_inst(
        &mut self,
        inst: InstId,
        block: BlockId,
        prev: Option<InstId>,
        next: Option<InstId>,
    ) {
        debug_assert!(!self.is_inst_inserted(inst));

        match prev {
            Some(prev) => self.insts[prev].next = Some(inst),
            None => self.blocks[block].first_inst = Some(inst),
        }
        match next {
            Some(next) => self.insts[next].prev = Some(inst),
            None => self.blocks[block].last_inst = Some(inst),
        }

        self.insts[inst] = InstNode {
            block: Some(block),
            prev,
            next,
        };
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct BlockNode {
    prev: Option<BlockId>,
    next: Option<BlockId>,
    first_inst: Option<InstId>,
    last_inst: Option<InstId>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct InstNode {
    /// `None` iff the instruction is not inserted.
    block: Option<BlockId>,
    prev: Option<InstId>,
    next: Option<InstId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dfg::DataFlowGraph, inst::InstData};

    fn make_insts(dfg: &mut DataFlowGraph, n: usize) -> Vec<InstId> {
        (0..n).map(|_| dfg.make_inst(InstData::Unreachable)).collect()
    }

    #[test]
    fn block_insertion_and_removal() {
        let mut dfg = DataFlowGraph::new();
        let mut layout = Layout::new();

        let b0 = dfg.make_block();
        let b1 = dfg.make_block();
        let b2 = dfg.make_block();
        let b3 = dfg.make_block();

        layout.append_block(b0);
        layout.append_block(b2);
        layout.insert_block_before(b1, b2);
        layout.insert_block_after(b3, b2);
        assert_eq!(layout.iter_block().collect::<Vec<_>>(), [b0, b1, b2, b3]);
        assert_eq!(layout.entry_block(), Some(b0));
        assert_eq!(layout.last_block(), Some(b3));

        layout.remove_block(b0);
        layout.remove_block(b3);
        assert_eq!(layout.iter_block().collect::<Vec<_>>(), [b1, b2]);
        assert_eq!(layout.entry_block(), Some(b1));
        assert_eq!(layout.last_block(), Some(b2));
        assert!(!layout.is_block_inserted(b0));

        layout.remove_block(b1);
        layout.remove_block(b2);
        assert_eq!(layout.entry_block(), None);
        assert_eq!(layout.last_block(), None);
    }

    #[test]
    fn inst_insertion_and_removal() {
        let mut dfg = DataFlowGraph::new();
        let mut layout = Layout::new();
        let block = dfg.make_block();
        layout.append_block(block);

        let insts = make_insts(&mut dfg, 4);
        layout.append_inst(insts[1], block);
        layout.prepend_inst(insts[0], block);
        layout.insert_inst_after(insts[3], insts[1]);
        layout.insert_inst_before(insts[2], insts[3]);
        assert_eq!(layout.iter_inst(block).collect::<Vec<_>>(), insts);
        assert_eq!(
            layout.iter_inst_rev(block).collect::<Vec<_>>(),
            insts.iter().rev().copied().collect::<Vec<_>>()
        );
        assert!(layout.is_before_in_block(insts[0], insts[3]));
        assert!(!layout.is_before_in_block(insts[3], insts[0]));

        layout.remove_inst(insts[0]);
        layout.remove_inst(insts[3]);
        assert_eq!(layout.first_inst_of(block), Some(insts[1]));
        assert_eq!(layout.last_inst_of(block), Some(insts[2]));
        assert!(!layout.is_inst_inserted(insts[0]));

        layout.remove_inst(insts[1]);
        layout.remove_inst(insts[2]);
        assert!(layout.is_block_empty(block));
    }
}

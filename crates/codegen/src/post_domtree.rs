//! Post dominance over the reversed control flow graph.
//!
//! Every exit block of the function is connected to a virtual exit, which
//! becomes the root of the reversed graph. A second virtual block links the
//! virtual exit with the real entry so that functions without any exit still
//! produce a connected tree.

use raystack_ir::{BlockId, ControlFlowGraph, Function, InstId};

use crate::domtree::DomTree;

#[derive(Debug, Default)]
pub struct PostDomTree {
    virtual_entry: Option<BlockId>,
    virtual_exit: Option<BlockId>,
    rcfg: ControlFlowGraph,
    tree: DomTree,
}

/// The immediate post dominator of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostIdom {
    /// `block` is only post dominated by the function exit.
    Exit,
    /// `block` can not reach any exit.
    Entry,
    Block(BlockId),
}

impl PostDomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, func: &Function) {
        self.rcfg.clear();
        self.tree.clear();
        self.virtual_entry = None;
        self.virtual_exit = None;

        self.rcfg.compute(func);
        let Some(entry) = self.rcfg.entry() else {
            return;
        };

        let virtual_entry = BlockId(func.dfg.blocks.len() as u32);
        let virtual_exit = BlockId(virtual_entry.0 + 1);
        self.rcfg.add_edge(virtual_entry, entry);
        self.rcfg.add_edge(virtual_entry, virtual_exit);
        for exit in std::mem::take(&mut self.rcfg.exits) {
            self.rcfg.add_edge(exit, virtual_exit);
        }
        self.rcfg.reverse_edges(virtual_exit, &[virtual_entry]);
        self.tree.compute(&self.rcfg);

        self.virtual_entry = Some(virtual_entry);
        self.virtual_exit = Some(virtual_exit);
    }

    pub fn idom_of(&self, block: BlockId) -> Option<PostIdom> {
        let idom = self.tree.idom_of(block)?;
        Some(if Some(idom) == self.virtual_exit {
            PostIdom::Exit
        } else if Some(idom) == self.virtual_entry {
            PostIdom::Entry
        } else {
            PostIdom::Block(idom)
        })
    }

    /// Returns `true` if every path from `block` to an exit passes through
    /// `post_dom`.
    pub fn post_dominates(&self, post_dom: BlockId, block: BlockId) -> bool {
        self.tree.dominates(post_dom, block)
    }

    /// Returns `true` if `post_dom` executes on every path from `inst` to an
    /// exit. An instruction post dominates itself.
    pub fn inst_post_dominates(&self, func: &Function, post_dom: InstId, inst: InstId) -> bool {
        let post_dom_block = func.layout.inst_block(post_dom);
        let block = func.layout.inst_block(inst);
        if post_dom_block == block {
            post_dom == inst || func.layout.is_before_in_block(inst, post_dom)
        } else {
            self.tree.strictly_dominates(post_dom_block, block)
        }
    }

    /// Returns `true` if `block` reaches an exit.
    pub fn reaches_exit(&self, block: BlockId) -> bool {
        self.tree.is_reachable(block)
    }
}

//! Block dominance, used to check that a moved instruction still dominates
//! its new users.
//!
//! The tree is computed with the iterative scheme of Cooper, Harvey and
//! Kennedy, "A Simple, Fast Dominance Algorithm":
//! <https://www.cs.rice.edu/~keith/EMBED/dom.pdf>

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};

use raystack_ir::{BlockId, ControlFlowGraph, Function, InstId};

#[derive(Default, Debug)]
pub struct DomTree {
    idoms: SecondaryMap<BlockId, PackedOption<BlockId>>,
    /// Root of the tree. Its own slot in `idoms` points to itself.
    root: Option<BlockId>,
}

impl DomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cfg(cfg: &ControlFlowGraph) -> Self {
        let mut tree = Self::new();
        tree.compute(cfg);
        tree
    }

    pub fn clear(&mut self) {
        self.idoms.clear();
        self.root = None;
    }

    /// Immediate dominator of `block`, `None` for the root and for blocks
    /// the root never reaches.
    pub fn idom_of(&self, block: BlockId) -> Option<BlockId> {
        if self.root == Some(block) {
            None
        } else {
            self.idoms[block].expand()
        }
    }

    pub fn strictly_dominates(&self, dom: BlockId, block: BlockId) -> bool {
        let mut cur = block;
        while let Some(idom) = self.idom_of(cur) {
            if idom == dom {
                return true;
            }
            cur = idom;
        }
        false
    }

    pub fn dominates(&self, dom: BlockId, block: BlockId) -> bool {
        dom == block || self.strictly_dominates(dom, block)
    }

    /// Instruction level dominance. An instruction dominates itself.
    pub fn inst_dominates(&self, func: &Function, dom: InstId, inst: InstId) -> bool {
        let dom_block = func.layout.inst_block(dom);
        let block = func.layout.inst_block(inst);
        if dom_block == block {
            dom == inst || func.layout.is_before_in_block(dom, inst)
        } else {
            self.strictly_dominates(dom_block, block)
        }
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idoms[block].is_some()
    }

    pub fn compute(&mut self, cfg: &ControlFlowGraph) {
        self.clear();

        let mut rpo: Vec<BlockId> = cfg.post_order().collect();
        rpo.reverse();
        let Some(&root) = rpo.first() else {
            return;
        };
        self.root = Some(root);
        self.idoms[root] = root.into();

        // Larger numbers come first in reverse post order.
        let mut order = SecondaryMap::with_capacity(rpo.len());
        for (i, &block) in rpo.iter().enumerate() {
            order[block] = (rpo.len() - i) as u32;
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &block in &rpo[1..] {
                let mut preds = cfg
                    .preds_of(block)
                    .copied()
                    .filter(|&pred| self.idoms[pred].is_some());
                let Some(first) = preds.next() else {
                    continue;
                };
                let idom = preds.fold(first, |acc, pred| self.intersect(acc, pred, &order));
                if self.idoms[block].expand() != Some(idom) {
                    self.idoms[block] = idom.into();
                    changed = true;
                }
            }
        }
    }

    fn intersect(
        &self,
        mut lhs: BlockId,
        mut rhs: BlockId,
        order: &SecondaryMap<BlockId, u32>,
    ) -> BlockId {
        while lhs != rhs {
            while order[lhs] < order[rhs] {
                lhs = self.idoms[lhs].expand().unwrap_or(rhs);
            }
            while order[rhs] < order[lhs] {
                rhs = self.idoms[rhs].expand().unwrap_or(lhs);
            }
        }
        lhs
    }
}

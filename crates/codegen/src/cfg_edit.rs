use std::collections::BTreeSet;

use raystack_ir::{
    func_cursor::{CursorLocation, FuncCursor, InstInserter},
    BlockId, ControlFlowGraph, Function, InstData, InstId, ValueId,
};

/// CFG editing helpers that keep CFG preds and phi incoming blocks
/// consistent.
pub struct CfgEditor<'f> {
    func: &'f mut Function,
    cfg: ControlFlowGraph,
}

impl<'f> CfgEditor<'f> {
    pub fn new(func: &'f mut Function) -> Self {
        let mut cfg = ControlFlowGraph::default();
        cfg.compute(func);
        Self { func, cfg }
    }

    pub fn func(&self) -> &Function {
        self.func
    }

    pub fn func_mut(&mut self) -> &mut Function {
        self.func
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    pub fn recompute_cfg(&mut self) {
        self.cfg.compute(self.func);
    }

    /// Moves every instruction after `at` into a new block placed right after
    /// the block of `at`.
    ///
    /// The original block is left without a terminator; the caller is
    /// expected to append one.
    pub fn split_block_after(&mut self, at: InstId) -> BlockId {
        let from = self.func.layout.inst_block(at);
        let succs: BTreeSet<_> = self.cfg.succs_of(from).copied().collect();

        let new_block = self.func.dfg.make_block();
        InstInserter::at_location(CursorLocation::BlockTop(from)).insert_block(self.func, new_block);

        let insts: Vec<_> =
            std::iter::successors(self.func.layout.next_inst_of(at), |&inst| {
                self.func.layout.next_inst_of(inst)
            })
            .collect();
        for inst in insts {
            self.func.layout.remove_inst(inst);
            self.func.layout.append_inst(inst, new_block);
        }

        for succ in succs {
            replace_phi_incoming_block(self.func, succ, from, new_block);
        }

        self.recompute_cfg();
        new_block
    }

    /// Merges every block into its predecessor when the predecessor ends with
    /// an unconditional jump to it and it has no other predecessor.
    pub fn merge_jump_chains(&mut self) -> bool {
        let mut changed = false;
        loop {
            let candidate = self.func.layout.iter_block().find_map(|block| {
                if Some(block) == self.func.layout.entry_block() || self.cfg.pred_num_of(block) != 1
                {
                    return None;
                }
                let pred = *self.cfg.preds_of(block).next()?;
                if pred == block {
                    return None;
                }
                let term = self.func.layout.last_inst_of(pred)?;
                matches!(self.func.dfg.inst(term), InstData::Jump { dest } if *dest == block)
                    .then_some((pred, block, term))
            });

            let Some((pred, block, term)) = candidate else {
                break;
            };
            self.merge_into_pred(pred, block, term);
            changed = true;
        }

        changed
    }

    fn merge_into_pred(&mut self, pred: BlockId, block: BlockId, jump: InstId) {
        let succs: Vec<_> = self.cfg.succs_of(block).copied().collect();

        InstInserter::at_location(CursorLocation::At(jump)).remove_inst(self.func);

        let insts: Vec<_> = self.func.layout.iter_inst(block).collect();
        for inst in insts {
            // A block with a single predecessor has trivial phis.
            if let InstData::Phi { args, .. } = self.func.dfg.inst(inst) {
                let incoming = args[0].0;
                if let Some(result) = self.func.dfg.inst_result(inst) {
                    self.func.dfg.change_to_alias(result, incoming);
                }
                InstInserter::at_location(CursorLocation::At(inst)).remove_inst(self.func);
                continue;
            }
            self.func.layout.remove_inst(inst);
            self.func.layout.append_inst(inst, pred);
        }
        self.func.layout.remove_block(block);

        for succ in succs {
            replace_phi_incoming_block(self.func, succ, block, pred);
        }

        self.recompute_cfg();
    }
}

/// Unlinks `inst` from the layout and drops it from the user sets of its
/// operands.
pub fn erase_inst(func: &mut Function, inst: InstId) {
    InstInserter::at_location(CursorLocation::At(inst)).remove_inst(func);
}

/// Redirects every use of the result of `inst` to `value` and erases `inst`.
pub fn replace_inst_with(func: &mut Function, inst: InstId, value: ValueId) {
    if let Some(result) = func.dfg.inst_result(inst) {
        func.dfg.change_to_alias(result, value);
    }
    erase_inst(func, inst);
}

pub fn iter_phis_in_block(func: &Function, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
    func.layout
        .iter_inst(block)
        .take_while(|&inst| func.dfg.is_phi(inst))
}

pub fn replace_phi_incoming_block(func: &mut Function, block: BlockId, from: BlockId, to: BlockId) {
    let phis: Vec<_> = iter_phis_in_block(func, block).collect();
    for phi in phis {
        func.dfg.rewrite_phi_pred(phi, from, to);
    }
}

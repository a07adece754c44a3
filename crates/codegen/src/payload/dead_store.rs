use raystack_ir::{
    inst::TraceCtrl, ControlFlowGraph, FuncRef, Function, InstId, Module, RtInst,
};
use tracing::{debug, instrument};

use super::{inst_reaches, payload_accesses, payload_base, PayloadAccess, PayloadInterval};
use crate::{
    cfg_edit::{erase_inst, CfgEditor},
    post_domtree::PostDomTree,
};

/// Deletes payload stores of `any_hit` that `closest_hit` overwrites before
/// reading them. Returns the number of deleted stores.
///
/// The pair must be connected by the single commit dispatch of the any-hit
/// shader; nothing is deleted otherwise.
#[instrument(level = "debug", skip_all)]
pub fn eliminate_dead_stores(module: &mut Module, any_hit: FuncRef, closest_hit: FuncRef) -> usize {
    CfgEditor::new(&mut module.funcs[any_hit]).merge_jump_chains();

    let dead = find_dead_stores(module, any_hit, closest_hit);
    for &store in &dead {
        erase_inst(&mut module.funcs[any_hit], store);
    }
    if !dead.is_empty() {
        debug!(
            any_hit = module.func_name(any_hit),
            closest_hit = module.func_name(closest_hit),
            stores = dead.len(),
            "dead payload stores removed"
        );
    }
    dead.len()
}

fn find_dead_stores(module: &Module, any_hit: FuncRef, closest_hit: FuncRef) -> Vec<InstId> {
    let ah = &module.funcs[any_hit];
    let ch = &module.funcs[closest_hit];

    let Some(commit) = commit_dispatch(ah) else {
        debug!("any-hit shader has no single commit dispatch");
        return Vec::new();
    };
    let Some(ah_accesses) = payload_base(ah).and_then(|base| payload_accesses(ah, &module.types, base))
    else {
        return Vec::new();
    };
    let Some(ch_accesses) = payload_base(ch).and_then(|base| payload_accesses(ch, &module.types, base))
    else {
        return Vec::new();
    };

    let ah_view = FuncView::new(ah);
    let ch_view = FuncView::new(ch);

    ah_accesses
        .iter()
        .filter(|store| store.is_store())
        .filter(|store| ah_view.inst_post_dominates(commit, store.inst))
        .filter(|store| {
            !ah_accesses.iter().any(|load| {
                load.is_load()
                    && load.interval.overlaps(store.interval)
                    && ah_view.reaches(store.inst, load.inst)
                    && ah_view.reaches(load.inst, commit)
            })
        })
        .filter(|store| ch_view.overwrites_before_read(&ch_accesses, store.interval))
        .map(|store| store.inst)
        .collect()
}

/// The single dispatch of `func` committing its hit to the closest-hit
/// shader.
fn commit_dispatch(func: &Function) -> Option<InstId> {
    let mut commits = func
        .iter_insts()
        .filter(|inst| {
            matches!(
                func.dfg.rt(*inst),
                Some(RtInst::TraceRayAsync {
                    ctrl: TraceCtrl::Commit
                })
            )
        });
    let commit = commits.next()?;
    commits.next().is_none().then_some(commit)
}

struct FuncView<'a> {
    func: &'a Function,
    cfg: ControlFlowGraph,
    post_domtree: PostDomTree,
}

impl<'a> FuncView<'a> {
    fn new(func: &'a Function) -> Self {
        let mut cfg = ControlFlowGraph::default();
        cfg.compute(func);
        let mut post_domtree = PostDomTree::new();
        post_domtree.compute(func);
        Self {
            func,
            cfg,
            post_domtree,
        }
    }

    fn reaches(&self, from: InstId, to: InstId) -> bool {
        inst_reaches(self.func, &self.cfg, from, to)
    }

    fn inst_post_dominates(&self, post_dom: InstId, inst: InstId) -> bool {
        self.post_domtree.inst_post_dominates(self.func, post_dom, inst)
    }

    /// Returns `true` if some store executed on every path fully overwrites
    /// `interval` before any load may observe it.
    fn overwrites_before_read(&self, accesses: &[PayloadAccess], interval: PayloadInterval) -> bool {
        let Some(entry) = self.func.layout.entry_block() else {
            return false;
        };
        accesses.iter().any(|store| {
            store.is_store()
                && store.interval.covers(interval)
                && self
                    .post_domtree
                    .post_dominates(self.func.layout.inst_block(store.inst), entry)
                && !accesses.iter().any(|load| {
                    load.is_load()
                        && load.interval.overlaps(interval)
                        && self.reaches(load.inst, store.inst)
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use raystack_ir::{builder::ModuleBuilder, InstData, ValueId};

    use super::*;
    use crate::test_util::*;

    struct HitPair {
        module: Module,
        any_hit: FuncRef,
        closest_hit: FuncRef,
        stores: Vec<InstId>,
    }

    /// The any-hit stores each `(offset, value)` word, optionally loads
    /// `load_at`, then commits. The closest-hit overwrites `overwrite`.
    fn hit_pair(words: &[(i64, i32)], load_at: Option<i64>, overwrite: &[i64]) -> HitPair {
        let mut mb = test_module_builder();
        let any_hit = declare_shader(&mut mb, "ah", ShaderKind::AnyHit);
        let closest_hit = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);

        let mut builder = mb.func_builder(any_hit);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        let stores = words
            .iter()
            .map(|&(offset, word)| {
                let addr = builder.byte_offset(payload, offset);
                let value = builder.make_imm_value(word);
                builder.store(addr, value, 4)
            })
            .collect();
        builder.jump(b1);

        builder.switch_to_block(b1);
        if let Some(offset) = load_at {
            let addr = builder.byte_offset(payload, offset);
            builder.load(addr, Type::I32, 4);
        }
        builder.rt_no_result(RtInst::TraceRayAsync {
            ctrl: TraceCtrl::Commit,
        });
        builder.ret(None);

        overwrite_words(&mut mb, closest_hit, overwrite);

        HitPair {
            module: mb.build(),
            any_hit,
            closest_hit,
            stores,
        }
    }

    fn overwrite_words(mb: &mut ModuleBuilder, func: FuncRef, offsets: &[i64]) {
        let mut builder = mb.func_builder(func);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        for &offset in offsets {
            let addr = builder.byte_offset(payload, offset);
            let zero = builder.make_imm_value(0i32);
            builder.store(addr, zero, 4);
        }
        builder.ret(None);
    }

    fn surviving_stores(module: &Module, func: FuncRef) -> Vec<ValueId> {
        let func = &module.funcs[func];
        func
            .iter_insts()
            .filter_map(|inst| match func.dfg.inst(inst) {
                InstData::Store { value, .. } => Some(*value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn overwritten_store_is_removed() {
        let mut pair = hit_pair(&[(0, 1), (4, 2)], None, &[0]);
        let removed = eliminate_dead_stores(&mut pair.module, pair.any_hit, pair.closest_hit);
        assert_eq!(removed, 1);

        let func = &pair.module.funcs[pair.any_hit];
        assert!(!func.layout.is_inst_inserted(pair.stores[0]));
        assert!(func.layout.is_inst_inserted(pair.stores[1]));
        // The jump chain was folded into the entry block.
        assert_eq!(func.layout.iter_block().count(), 1);
    }

    #[test]
    fn store_read_before_commit_survives() {
        let mut pair = hit_pair(&[(0, 1)], Some(0), &[0]);
        assert_eq!(
            eliminate_dead_stores(&mut pair.module, pair.any_hit, pair.closest_hit),
            0
        );
        assert_eq!(surviving_stores(&pair.module, pair.any_hit).len(), 1);
    }

    #[test]
    fn partial_overwrite_keeps_store() {
        let mut mb = test_module_builder();
        let any_hit = declare_shader(&mut mb, "ah", ShaderKind::AnyHit);
        let closest_hit = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);

        let mut builder = mb.func_builder(any_hit);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        let wide = builder.make_imm_value(7i64);
        builder.store(payload, wide, 8);
        builder.rt_no_result(RtInst::TraceRayAsync {
            ctrl: TraceCtrl::Commit,
        });
        builder.ret(None);
        overwrite_words(&mut mb, closest_hit, &[0]);

        let mut module = mb.build();
        assert_eq!(eliminate_dead_stores(&mut module, any_hit, closest_hit), 0);
    }

    #[test]
    fn closest_hit_reading_first_keeps_store() {
        let mut mb = test_module_builder();
        let any_hit = declare_shader(&mut mb, "ah", ShaderKind::AnyHit);
        let closest_hit = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);

        let mut builder = mb.func_builder(any_hit);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        let one = builder.make_imm_value(1i32);
        builder.store(payload, one, 4);
        builder.rt_no_result(RtInst::TraceRayAsync {
            ctrl: TraceCtrl::Commit,
        });
        builder.ret(None);

        let mut builder = mb.func_builder(closest_hit);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        let old = builder.load(payload, Type::I32, 4);
        let new = builder.add(old, old);
        builder.store(payload, new, 4);
        builder.ret(None);

        let mut module = mb.build();
        assert_eq!(eliminate_dead_stores(&mut module, any_hit, closest_hit), 0);
    }

    #[test]
    fn store_off_the_commit_path_survives() {
        let mut mb = test_module_builder();
        let any_hit = declare_shader(&mut mb, "ah", ShaderKind::AnyHit);
        let closest_hit = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);

        let mut builder = mb.func_builder(any_hit);
        let b0 = builder.append_block();
        let accept = builder.append_block();
        let ignore = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        let one = builder.make_imm_value(1i32);
        builder.store(payload, one, 4);
        let cond = builder.make_imm_value(true);
        builder.br(cond, accept, ignore);

        builder.switch_to_block(accept);
        builder.rt_no_result(RtInst::TraceRayAsync {
            ctrl: TraceCtrl::Commit,
        });
        builder.ret(None);

        builder.switch_to_block(ignore);
        builder.ret(None);
        overwrite_words(&mut mb, closest_hit, &[0]);

        let mut module = mb.build();
        assert_eq!(eliminate_dead_stores(&mut module, any_hit, closest_hit), 0);
    }

    #[test]
    fn missing_commit_disables_elimination() {
        let mut mb = test_module_builder();
        let any_hit = declare_shader(&mut mb, "ah", ShaderKind::AnyHit);
        let closest_hit = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);
        overwrite_words(&mut mb, any_hit, &[0]);
        overwrite_words(&mut mb, closest_hit, &[0]);

        let mut module = mb.build();
        assert_eq!(eliminate_dead_stores(&mut module, any_hit, closest_hit), 0);
    }
}

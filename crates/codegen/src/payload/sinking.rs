use std::collections::BTreeSet;

use raystack_ir::{
    func_cursor::CursorLocation, BlockId, ControlFlowGraph, FuncRef, Function, InstData, InstId,
    Module, RtInst, ValueId,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, instrument, warn};

use super::{inst_reaches, payload_accesses, payload_base, PayloadAccess};
use crate::{cfg_edit::erase_inst, context::RtContext, domtree::DomTree, rt_builder::RtBuilder};

/// Moves payload stores of hit and miss shaders past the signposts of the
/// continuations inlined into them, addressing the payload through the
/// continuation frame instead of the payload pointer.
pub struct PayloadSinking<'a> {
    ctx: &'a RtContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SignpostSite {
    inst: InstId,
    frame: ValueId,
    payload_offset: u64,
}

struct SinkPlan {
    store: InstId,
    value: ValueId,
    align: u32,
    chain: SmallVec<[InstId; 4]>,
    sites: SmallVec<[SignpostSite; 2]>,
}

impl<'a> PayloadSinking<'a> {
    pub fn new(ctx: &'a RtContext) -> Self {
        Self { ctx }
    }

    /// Returns the number of sunk stores.
    #[instrument(level = "debug", skip_all)]
    pub fn run(&mut self, module: &mut Module) -> usize {
        if !self.ctx.config.payload_sinking || self.ctx.payload_sinking_blocked {
            return 0;
        }

        let planned: Vec<(FuncRef, Vec<SinkPlan>)> = module
            .iter_functions()
            .map(|func| (func, plan_function(&module.funcs[func], module)))
            .filter(|(_, plans)| !plans.is_empty())
            .collect();

        let mut sunk = 0;
        for (func, plans) in planned {
            debug!(
                func = module.func_name(func),
                stores = plans.len(),
                "sinking payload stores"
            );
            sunk += plans.len();
            apply(module, func, &plans);
        }
        sunk
    }
}

fn plan_function(func: &Function, module: &Module) -> Vec<SinkPlan> {
    let signposts: FxHashMap<InstId, SignpostSite> = func
        .iter_insts()
        .filter_map(|inst| match func.dfg.rt(inst) {
            Some(RtInst::Signpost {
                offset: Some(payload_offset),
                ..
            }) => Some((
                inst,
                SignpostSite {
                    inst,
                    frame: func.dfg.inst_result(inst)?,
                    payload_offset: *payload_offset,
                },
            )),
            _ => None,
        })
        .collect();
    if signposts.is_empty() {
        return Vec::new();
    }
    let Some(accesses) =
        payload_base(func).and_then(|base| payload_accesses(func, &module.types, base))
    else {
        return Vec::new();
    };

    let mut cfg = ControlFlowGraph::default();
    cfg.compute(func);
    let domtree = DomTree::with_cfg(&cfg);

    accesses
        .iter()
        .filter(|store| store.is_store() && !may_alias_later(func, &cfg, &accesses, store))
        .filter_map(|store| {
            let sites = signpost_frontier(func, &cfg, &signposts, store.inst)?;
            if !sites
                .iter()
                .all(|site| domtree.inst_dominates(func, store.inst, site.inst))
            {
                return None;
            }
            let InstData::Store { value, align, .. } = func.dfg.inst(store.inst) else {
                return None;
            };
            Some(SinkPlan {
                store: store.inst,
                value: *value,
                align: *align,
                chain: store.chain.clone(),
                sites,
            })
        })
        .collect()
}

/// Returns `true` if another payload access overlapping `store` may run
/// after it.
fn may_alias_later(
    func: &Function,
    cfg: &ControlFlowGraph,
    accesses: &[PayloadAccess],
    store: &PayloadAccess,
) -> bool {
    accesses.iter().any(|other| {
        other.inst != store.inst
            && other.interval.overlaps(store.interval)
            && inst_reaches(func, cfg, store.inst, other.inst)
    })
}

/// The first signposts met on every path from `store` to an exit, or `None`
/// if some path exits or loops back to `store` without meeting one.
fn signpost_frontier(
    func: &Function,
    cfg: &ControlFlowGraph,
    signposts: &FxHashMap<InstId, SignpostSite>,
    store: InstId,
) -> Option<SmallVec<[SignpostSite; 2]>> {
    let mut frontier = SmallVec::new();
    let mut next = func.layout.next_inst_of(store);
    while let Some(inst) = next {
        if let Some(site) = signposts.get(&inst) {
            frontier.push(*site);
            return Some(frontier);
        }
        next = func.layout.next_inst_of(inst);
    }

    let start = func.layout.inst_block(store);
    let mut stack: Vec<BlockId> = cfg.succs_of(start).copied().collect();
    if stack.is_empty() {
        return None;
    }
    let mut visited = BTreeSet::new();
    while let Some(block) = stack.pop() {
        if !visited.insert(block) {
            continue;
        }

        let mut found = None;
        for inst in func.layout.iter_inst(block) {
            if inst == store {
                return None;
            }
            if let Some(site) = signposts.get(&inst) {
                found = Some(*site);
                break;
            }
        }

        match found {
            Some(site) => {
                if !frontier.contains(&site) {
                    frontier.push(site);
                }
            }
            None => {
                let succs = cfg.succs_of(block).copied();
                let len = stack.len();
                stack.extend(succs);
                if stack.len() == len {
                    return None;
                }
            }
        }
    }
    Some(frontier)
}

fn apply(module: &mut Module, func: FuncRef, plans: &[SinkPlan]) {
    // Sunk stores keep their original order behind each signpost.
    let mut insert_after: FxHashMap<InstId, InstId> = FxHashMap::default();

    for plan in plans {
        for site in &plan.sites {
            let at = insert_after.get(&site.inst).copied().unwrap_or(site.inst);
            let mut builder = RtBuilder::at(module, func, CursorLocation::At(at));

            let mut addr = builder.offset_ptr(site.frame, site.payload_offset as i64);
            for &link in &plan.chain {
                addr = match builder.func().dfg.inst(link).clone() {
                    InstData::Gep {
                        elem_ty, indices, ..
                    } => builder.gep(addr, elem_ty, &indices),
                    InstData::Cast { code, ty, .. } => builder.cast(code, addr, ty),
                    _ => addr,
                };
            }
            let store = builder.store(addr, plan.value, plan.align);
            insert_after.insert(site.inst, store);
        }
        erase_inst(&mut module.funcs[func], plan.store);
    }
}

/// Returns `true` if `func` branches on payload contents into regions that
/// suspend into the same continuation with different parameters.
///
/// Once such a shader is inlined into its continuations, the signposts no
/// longer tell which invocation a payload store belongs to.
pub fn has_ambiguous_payload_branch(func: &Function) -> bool {
    let Some(base) = payload_base(func) else {
        return false;
    };
    let mut cfg = ControlFlowGraph::default();
    cfg.compute(func);

    for block in func.layout.iter_block() {
        let Some(term) = func.layout.last_inst_of(block) else {
            continue;
        };
        let cond = match func.dfg.inst(term) {
            InstData::Br { cond, .. } => *cond,
            InstData::Switch { scrutinee, .. } => *scrutinee,
            _ => continue,
        };
        if !depends_on(func, cond, base) {
            continue;
        }

        let succs: BTreeSet<BlockId> = cfg.succs_of(block).copied().collect();
        let reached: Vec<BTreeSet<InstId>> = succs
            .iter()
            .map(|succ| suspends_reachable_from(func, &cfg, *succ))
            .collect();
        let exclusive: Vec<BTreeSet<InstId>> = reached
            .iter()
            .enumerate()
            .map(|(i, own)| {
                own.iter()
                    .copied()
                    .filter(|site| {
                        reached
                            .iter()
                            .enumerate()
                            .all(|(j, other)| i == j || !other.contains(site))
                    })
                    .collect()
            })
            .collect();

        for (i, lhs) in exclusive.iter().enumerate() {
            for rhs in &exclusive[i + 1..] {
                let conflict = lhs.iter().any(|a| {
                    rhs.iter()
                        .any(|b| conflicting_invocations(func, *a, *b))
                });
                if conflict {
                    return true;
                }
            }
        }
    }
    false
}

/// Blocks payload sinking for the rest of the compilation when a shader of
/// `module` has ambiguous payload dependent control flow. Returns the
/// resulting state of the flag.
#[instrument(level = "debug", skip_all)]
pub fn check_sinking_ambiguity(module: &Module, ctx: &mut RtContext) -> bool {
    if !ctx.config.payload_sinking || ctx.payload_sinking_blocked {
        return ctx.payload_sinking_blocked;
    }
    let ambiguous = module
        .iter_functions()
        .find(|func| has_ambiguous_payload_branch(&module.funcs[*func]));
    if let Some(func) = ambiguous {
        warn!(
            func = module.func_name(func),
            "payload dependent control flow reaches one continuation with different parameters, payload sinking disabled"
        );
        ctx.payload_sinking_blocked = true;
    }
    ctx.payload_sinking_blocked
}

fn depends_on(func: &Function, value: ValueId, target: ValueId) -> bool {
    let mut visited = BTreeSet::new();
    let mut stack = vec![value];
    while let Some(value) = stack.pop() {
        if value == target {
            return true;
        }
        if !visited.insert(value) {
            continue;
        }
        if let Some(inst) = func.dfg.value_inst(value) {
            func.dfg.inst(inst).visit_values(&mut |operand| stack.push(operand));
        }
    }
    false
}

fn suspends_reachable_from(
    func: &Function,
    cfg: &ControlFlowGraph,
    block: BlockId,
) -> BTreeSet<InstId> {
    cfg.reachable_from(block)
        .into_iter()
        .flat_map(|block| func.layout.iter_inst(block))
        .filter(|inst| func.dfg.inst(*inst).suspend_target().is_some())
        .collect()
}

fn conflicting_invocations(func: &Function, a: InstId, b: InstId) -> bool {
    match (invocation(func, a), invocation(func, b)) {
        (Some((cont_a, params_a)), Some((cont_b, params_b))) => {
            cont_a == cont_b && params_a != params_b
        }
        _ => false,
    }
}

/// The continuation a suspension point resumes and its parameters, without
/// the spill bookkeeping.
fn invocation(func: &Function, inst: InstId) -> Option<(FuncRef, RtInst)> {
    match func.dfg.rt(inst)? {
        RtInst::TraceRay(data) => {
            let mut data = data.clone();
            data.spill_size = None;
            Some((data.cont.func, RtInst::TraceRay(data)))
        }
        RtInst::CallShader(data) => {
            let mut data = data.clone();
            data.spill_size = None;
            Some((data.cont.func, RtInst::CallShader(data)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use raystack_ir::{builder::ModuleBuilder, inst::CmpOp};

    use super::*;
    use crate::{config::LoweringConfig, test_util::*};

    fn sinking_ctx() -> RtContext {
        test_ctx_with(LoweringConfig {
            payload_sinking: true,
            ..LoweringConfig::default()
        })
    }

    /// Base value and byte offset of `addr` through constant `i8` geps.
    fn byte_offset_of(module: &Module, func: FuncRef, mut addr: ValueId) -> (ValueId, i64) {
        let dfg = &module.funcs[func].dfg;
        let mut offset = 0;
        while let Some(InstData::Gep { base, indices, .. }) =
            dfg.value_inst(addr).map(|inst| dfg.inst(inst))
        {
            offset += dfg.value_imm(indices[0]).unwrap().as_i64().unwrap();
            addr = *base;
        }
        (addr, offset)
    }

    struct Sinkable {
        module: Module,
        func: FuncRef,
        store: InstId,
        stored: ValueId,
        signpost: ValueId,
    }

    /// A closest-hit shader storing an `f32` at payload offset 4 before the
    /// signpost of an inlined continuation whose payload sits at frame
    /// offset 8. `between` runs between the store and the signpost.
    fn sinkable(between: impl FnOnce(&mut RtBuilder, ValueId)) -> Sinkable {
        let mut mb = test_module_builder();
        let func = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);
        let mut module = mb.build();

        let mut builder = RtBuilder::at(&mut module, func, CursorLocation::NoWhere);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let base = builder.sw_stack_base();
        let loaded = builder.load(base, GLOBAL_PTR, 8);
        let payload = builder.rt(
            RtInst::PayloadPtr {
                payload: loaded,
                frame_addr: base,
            },
            GLOBAL_PTR,
        );
        let addr = builder.offset_ptr(payload, 4);
        let stored = builder.make_imm_value(2.0f32);
        let store = builder.store(addr, stored, 4);
        between(&mut builder, payload);

        let frame = builder.sw_stack_base();
        let signpost = builder.rt(
            RtInst::Signpost {
                frame_addr: frame,
                offset: Some(8),
            },
            GLOBAL_PTR,
        );
        builder.load_at(signpost, 12, Type::F32);
        builder.ret(None);

        Sinkable {
            module,
            func,
            store,
            stored,
            signpost,
        }
    }

    fn stores_of(module: &Module, func: FuncRef, value: ValueId) -> Vec<ValueId> {
        let f = &module.funcs[func];
        f
            .iter_insts()
            .filter_map(|inst| match f.dfg.inst(inst) {
                InstData::Store { addr, value: v, .. } if *v == value => Some(*addr),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn store_is_rebased_on_signpost_frame() {
        let mut s = sinkable(|_, _| {});
        let ctx = sinking_ctx();
        assert_eq!(PayloadSinking::new(&ctx).run(&mut s.module), 1);

        assert!(!s.module.funcs[s.func].layout.is_inst_inserted(s.store));
        let addrs = stores_of(&s.module, s.func, s.stored);
        assert_eq!(addrs.len(), 1);
        assert_eq!(byte_offset_of(&s.module, s.func, addrs[0]), (s.signpost, 12));
    }

    #[test]
    fn overlapping_load_before_signpost_blocks_sinking() {
        let mut s = sinkable(|builder, payload| {
            builder.load_at(payload, 4, Type::F32);
        });
        let ctx = sinking_ctx();
        assert_eq!(PayloadSinking::new(&ctx).run(&mut s.module), 0);
        assert!(s.module.funcs[s.func].layout.is_inst_inserted(s.store));
    }

    #[test]
    fn disjoint_load_does_not_block_sinking() {
        let mut s = sinkable(|builder, payload| {
            builder.load_at(payload, 0, Type::I32);
        });
        let ctx = sinking_ctx();
        assert_eq!(PayloadSinking::new(&ctx).run(&mut s.module), 1);
    }

    #[test]
    fn exit_without_signpost_blocks_sinking() {
        let mut mb = test_module_builder();
        let func = declare_shader(&mut mb, "miss", ShaderKind::Miss);
        let mut module = mb.build();

        let mut builder = RtBuilder::at(&mut module, func, CursorLocation::NoWhere);
        let b0 = builder.append_block();
        let resume = builder.append_block();
        let bail = builder.append_block();
        builder.switch_to_block(b0);
        let base = builder.sw_stack_base();
        let payload = builder.rt(
            RtInst::PayloadPtr {
                payload: base,
                frame_addr: base,
            },
            GLOBAL_PTR,
        );
        let one = builder.make_imm_value(1i32);
        let store = builder.store(payload, one, 4);
        let cond = builder.make_imm_value(true);
        builder.br(cond, resume, bail);

        builder.switch_to_block(resume);
        let frame = builder.sw_stack_base();
        builder.rt(
            RtInst::Signpost {
                frame_addr: frame,
                offset: Some(0),
            },
            GLOBAL_PTR,
        );
        builder.ret(None);

        builder.switch_to_block(bail);
        builder.ret(None);

        let ctx = sinking_ctx();
        assert_eq!(PayloadSinking::new(&ctx).run(&mut module), 0);
        assert!(module.funcs[func].layout.is_inst_inserted(store));
    }

    #[test]
    fn blocked_context_leaves_module_untouched() {
        let mut s = sinkable(|_, _| {});
        let mut ctx = sinking_ctx();
        ctx.payload_sinking_blocked = true;
        assert_eq!(PayloadSinking::new(&ctx).run(&mut s.module), 0);
        assert!(s.module.funcs[s.func].layout.is_inst_inserted(s.store));
    }

    /// A closest-hit shader branching on the first payload word. Both arms
    /// trace into `ch.cont`; the else arm uses `else_payload` if given.
    fn branching_shader(branch_on_payload: bool, else_payload: bool) -> (Module, FuncRef) {
        let mut mb = test_module_builder();
        let func = declare_shader(&mut mb, "ch", ShaderKind::ClosestHit);
        let cont = declare_continuation(&mut mb, "ch.cont", ShaderKind::ClosestHit, func);
        let cont = ContRef { id: 3, func: cont };
        build_branches(&mut mb, func, cont, branch_on_payload, else_payload);
        (mb.build(), func)
    }

    fn build_branches(
        mb: &mut ModuleBuilder,
        func: FuncRef,
        cont: ContRef,
        branch_on_payload: bool,
        else_payload: bool,
    ) {
        let mut builder = mb.func_builder(func);
        let b0 = builder.append_block();
        let then_block = builder.append_block();
        let else_block = builder.append_block();
        builder.switch_to_block(b0);
        let payload = builder.payload();
        let lhs = if branch_on_payload {
            builder.load(payload, Type::I32, 4)
        } else {
            builder.make_imm_value(5i32)
        };
        let zero = builder.make_imm_value(0i32);
        let cond = builder.cmp(CmpOp::Eq, lhs, zero);
        builder.br(cond, then_block, else_block);

        builder.switch_to_block(then_block);
        trace_ray(&mut builder, payload, cont);
        builder.ret(None);

        builder.switch_to_block(else_block);
        let other = if else_payload {
            builder.make_undef_value(GLOBAL_PTR)
        } else {
            payload
        };
        trace_ray(&mut builder, other, cont);
        builder.ret(None);
    }

    #[test]
    fn payload_branch_with_different_parameters_is_ambiguous() {
        let (module, func) = branching_shader(true, true);
        assert!(has_ambiguous_payload_branch(&module.funcs[func]));

        let mut ctx = sinking_ctx();
        assert!(check_sinking_ambiguity(&module, &mut ctx));
        assert!(ctx.payload_sinking_blocked);
    }

    #[test]
    fn identical_invocations_are_not_ambiguous() {
        let (module, func) = branching_shader(true, false);
        assert!(!has_ambiguous_payload_branch(&module.funcs[func]));
    }

    #[test]
    fn branch_independent_of_payload_is_not_ambiguous() {
        let (module, func) = branching_shader(false, true);
        assert!(!has_ambiguous_payload_branch(&module.funcs[func]));

        let mut ctx = sinking_ctx();
        assert!(!check_sinking_ambiguity(&module, &mut ctx));
    }

    #[test]
    fn ambiguity_is_not_checked_without_sinking() {
        let (module, _) = branching_shader(true, true);
        let mut ctx = test_ctx_with(LoweringConfig {
            payload_sinking: false,
            ..LoweringConfig::default()
        });
        assert!(!check_sinking_ambiguity(&module, &mut ctx));
    }
}

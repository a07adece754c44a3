//! Rematerialization of spilled values and shrink-wrapping of the spill
//! region.
//!
//! Every live fill of a shader group is tried against three strategies in
//! priority order:
//!
//! 1. replaying the constant address arithmetic over a frame alloca,
//! 2. reading a ray field the ray-tracing unit leaves untouched,
//! 3. recreating the local buffer pointer, which promotes the continuations
//!    of the group to shader identifier slots.
//!
//! Accepted candidates are queued and applied once the whole group has been
//! analyzed. The surviving spills and fills then get tight offsets.
use std::cmp::Reverse;

use indexmap::IndexSet;
use raystack_ir::{
    inst::{CastOp, RAY_INFO_LEN},
    AddrSpace, BlockId, FuncRef, Function, Immediate, InstData, InstId, Module, RtInst, Type,
    ValueId,
};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, instrument};

use crate::{
    cfg_edit::{erase_inst, replace_inst_with},
    continuation::{
        continuation_group, entry_fills, root_functions, ContinuationInfo, InstRef, ValueRef,
    },
    context::RtContext,
    error::LoweringResult,
    rt_builder::{RtBuilder, CONST_PTR, GLOBAL_PTR},
    rt_format::async_stack,
    stack_frame::global_allocas,
};

/// One side-effect free step from an alloca address to a spilled pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChainOp {
    Gep {
        elem_ty: Type,
        indices: SmallVec<[Immediate; 4]>,
    },
    Bitcast {
        ty: Type,
    },
}

/// Address computation rooted at the `alloca`th frame alloca of the root.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AddressChain {
    alloca: u32,
    /// Steps in dominance order.
    ops: Vec<ChainOp>,
}

#[derive(Debug)]
enum RematAction {
    AllocaChain {
        fill: InstRef,
        spills: Vec<InstRef>,
        chain: AddressChain,
    },
    RayField {
        fill: InstRef,
        spills: Vec<InstRef>,
        index: usize,
    },
    LocalPointer {
        fill: InstRef,
        spills: Vec<InstRef>,
    },
}

impl RematAction {
    fn name(&self) -> &'static str {
        match self {
            Self::AllocaChain { .. } => "alloca chain",
            Self::RayField { .. } => "ray field",
            Self::LocalPointer { .. } => "local pointer",
        }
    }

    fn apply(self, module: &mut Module) {
        let (fill, spills) = match &self {
            Self::AllocaChain { fill, spills, .. }
            | Self::RayField { fill, spills, .. }
            | Self::LocalPointer { fill, spills } => (*fill, spills),
        };

        let mut builder = RtBuilder::before(module, fill.func, fill.inst);
        let value = match &self {
            Self::AllocaChain { chain, .. } => {
                let mut value = builder.alloca_number(chain.alloca);
                for op in &chain.ops {
                    value = match op {
                        ChainOp::Gep { elem_ty, indices } => {
                            let indices: SmallVec<[ValueId; 4]> = indices
                                .iter()
                                .map(|imm| builder.make_imm_value(*imm))
                                .collect();
                            builder.gep(value, *elem_ty, &indices)
                        }
                        ChainOp::Bitcast { ty } => builder.cast(CastOp::Bitcast, value, *ty),
                    };
                }
                value
            }
            Self::RayField { index, .. } => builder.ray_info_field(*index),
            Self::LocalPointer { .. } => builder.local_buffer_ptr(),
        };

        replace_with(module, fill, value);
        for spill in spills {
            let func = &mut module.funcs[spill.func];
            if func.layout.is_inst_inserted(spill.inst) {
                erase_inst(func, spill.inst);
            }
        }
    }
}

pub struct LateRemat<'a> {
    ctx: &'a RtContext,
}

impl<'a> LateRemat<'a> {
    pub fn new(ctx: &'a RtContext) -> Self {
        Self { ctx }
    }

    #[instrument(level = "debug", skip_all)]
    pub fn run(&mut self, module: &mut Module) -> LoweringResult<bool> {
        let mut changed = false;
        for root in root_functions(module) {
            changed |= self.run_on_group(module, root)?;
        }
        Ok(changed)
    }

    fn run_on_group(&mut self, module: &mut Module, root: FuncRef) -> LoweringResult<bool> {
        let group = continuation_group(module, root);
        let mut info = ContinuationInfo::calculate(module, root, group)?;

        let alloca_numbers: FxHashMap<InstId, u32> = global_allocas(&module.funcs[root])
            .into_iter()
            .zip(0..)
            .collect();
        let can_promote = info.can_promote(self.ctx);

        // A spill feeding two fills at the same offset must survive.
        let mut spill_uses: FxHashMap<InstRef, usize> = FxHashMap::default();
        for fill in info.fills() {
            for spill in info.spills_of(fill) {
                *spill_uses.entry(*spill).or_default() += 1;
            }
        }

        let mut actions = Vec::new();
        let mut promoted = false;
        let fills: Vec<_> = info.fills().collect();
        for fill in fills {
            let spills = info.spills_of(fill).to_vec();
            if spills.iter().any(|spill| spill_uses[spill] > 1) {
                continue;
            }

            let action = if let Some(chain) =
                alloca_chain(module, &info, &alloca_numbers, fill, &spills)
            {
                RematAction::AllocaChain {
                    fill,
                    spills,
                    chain,
                }
            } else if let Some(index) = self.ray_field(module, fill, &spills) {
                RematAction::RayField {
                    fill,
                    spills,
                    index,
                }
            } else if can_promote && is_local_pointer(module, &info, fill) {
                promoted = true;
                RematAction::LocalPointer { fill, spills }
            } else {
                continue;
            };

            debug!(
                func = module.func_name(fill.func),
                strategy = action.name(),
                "rematerializing fill"
            );
            actions.push(action);
            info.mark_dead(fill);
        }

        if promoted {
            self.assign_slots(module, &info);
        }

        let mut changed = !actions.is_empty();
        for action in actions {
            action.apply(module);
        }
        info.bulk_update();

        changed |= self.postprocess(module, &info);
        Ok(changed)
    }

    /// Returns the ray info index all `spills` write, if the ray-tracing unit
    /// keeps that field intact until the continuation runs.
    fn ray_field(&self, module: &Module, fill: InstRef, spills: &[InstRef]) -> Option<usize> {
        if self.ctx.config.max_trace_recursion_depth > 1 || fill_ty(module, fill)? != Type::F32 {
            return None;
        }

        let mut field = None;
        for spill in spills {
            let func = &module.funcs[spill.func];
            let Some(RtInst::Spill { value, .. }) = func.dfg.rt(spill.inst) else {
                return None;
            };

            // Spills feeding a shader call have no ray to read back.
            let block = func.layout.inst_block(spill.inst);
            let trace = func
                .layout
                .iter_inst_rev(block)
                .find_map(|inst| match func.dfg.rt(inst) {
                    Some(RtInst::TraceRay(data)) => Some(data),
                    _ => None,
                })?;

            let index = (0..RAY_INFO_LEN)
                .filter(|&i| i != async_stack::TMAX_INDEX)
                .find(|&i| trace.ray_info[i] == *value)?;
            match field {
                None => field = Some(index),
                Some(prev) if prev != index => return None,
                Some(_) => {}
            }
        }
        field
    }

    fn assign_slots(&self, module: &mut Module, info: &ContinuationInfo) {
        let first = self.ctx.caps.raygen_first_open_slot;
        for (slot, cont) in (first..).zip(info.group().values()) {
            if let Some(shader) = module.shader_info_mut(*cont) {
                shader.slot_num = Some(slot);
            }
        }
    }

    /// Reorders and shrinks the spill region of every continuation, then
    /// splits vector spills and fills into their elements.
    fn postprocess(&self, module: &mut Module, info: &ContinuationInfo) -> bool {
        let conts: IndexSet<FuncRef> = info.group().values().copied().collect();
        let mut changed = false;
        for cont in conts {
            changed |= self.shrink_wrap(module, info, cont);
        }

        let funcs: IndexSet<FuncRef> = info.functions().collect();
        for func in funcs {
            changed |= expand_vectors(module, func);
        }
        changed
    }

    fn shrink_wrap(&self, module: &mut Module, info: &ContinuationInfo, cont: FuncRef) -> bool {
        let config = &self.ctx.config;
        let fills = entry_fills(&module.funcs[cont]);
        if fills.is_empty() {
            return false;
        }

        let segments: Vec<_> = info
            .suspend_blocks(cont)
            .filter_map(|(func, block)| {
                let (spills, suspend) = spill_segment(&module.funcs[func], block, cont);
                Some(SpillSegment {
                    func,
                    block,
                    spills,
                    suspend: suspend?,
                })
            })
            .collect();
        let loop_segment = if config.disable_spill_reorder {
            None
        } else {
            segments.iter().find(|segment| segment.func == cont)
        };

        let sizes: FxHashMap<InstId, u64> = fills
            .iter()
            .map(|(fill, _)| {
                let ty = fill_ty(module, InstRef::new(cont, *fill)).unwrap_or(Type::Unit);
                (*fill, module.types.size_of(ty) as u64)
            })
            .collect();
        let offsets: FxHashMap<InstId, u64> = fills.iter().copied().collect();

        let mut order: Vec<InstId> = fills.iter().map(|(fill, _)| *fill).collect();
        if let Some(segment) = loop_segment {
            respills_last(module, segment, &mut order, &offsets);
        } else {
            if config.sort_fills_by_size {
                order.sort_by_key(|fill| Reverse(sizes[fill]));
            }
            if !config.disable_spill_reorder && segments.len() == 1 {
                respills_last(module, &segments[0], &mut order, &offsets);
            }
        }

        // Fills sharing an offset keep sharing it.
        let mut remap: FxHashMap<u64, u64> = FxHashMap::default();
        let mut cursor = 0;
        for fill in &order {
            remap.entry(offsets[fill]).or_insert_with(|| {
                let offset = cursor;
                cursor += sizes[fill];
                offset
            });
        }
        let spill_size = cursor;

        let func = &mut module.funcs[cont];
        for fill in &order {
            let new_offset = remap[&offsets[fill]];
            set_offset(func, *fill, new_offset);
        }
        reorder_fills(func, &order);

        for segment in &segments {
            let func = &mut module.funcs[segment.func];
            let mut kept = Vec::with_capacity(segment.spills.len());
            for &spill in &segment.spills {
                match offset_of(func, spill).and_then(|offset| remap.get(&offset)) {
                    Some(&new_offset) => {
                        set_offset(func, spill, new_offset);
                        kept.push((new_offset, spill));
                    }
                    None => {
                        debug!(offset = ?offset_of(func, spill), "dropping spill without fill");
                        erase_inst(func, spill);
                    }
                }
            }
            kept.sort_by_key(|(offset, _)| *offset);
            reorder_spills(func, segment.suspend, kept.iter().map(|(_, spill)| *spill));

            if config.pad_spills {
                set_spill_size(func, segment.suspend, spill_size);
            }
        }

        if config.rt_stack_opts {
            if let Some(segment) = loop_segment {
                let func = &mut module.funcs[cont];
                for &spill in &segment.spills {
                    if func.layout.is_inst_inserted(spill) && is_respill(func, spill) {
                        erase_inst(func, spill);
                    }
                }
            }
        }

        debug!(
            cont = module.func_name(cont),
            spill_size, "shrink-wrapped continuation spills"
        );
        true
    }
}

#[derive(Debug)]
struct SpillSegment {
    func: FuncRef,
    block: BlockId,
    spills: Vec<InstId>,
    suspend: InstId,
}

/// Spills preceding the last suspension into `cont` in `block`, together
/// with that suspension point.
fn spill_segment(func: &Function, block: BlockId, cont: FuncRef) -> (Vec<InstId>, Option<InstId>) {
    let mut current = Vec::new();
    let mut found = (Vec::new(), None);
    for inst in func.layout.iter_inst(block) {
        match func.dfg.inst(inst) {
            InstData::Rt(RtInst::Spill { .. }) => current.push(inst),
            data => {
                if let Some(target) = data.suspend_target() {
                    if target.func == cont {
                        found = (std::mem::take(&mut current), Some(inst));
                    } else {
                        current.clear();
                    }
                }
            }
        }
    }
    found
}

/// Stable partition of `order` moving the fills that `segment` writes back
/// unchanged to the end.
fn respills_last(
    module: &Module,
    segment: &SpillSegment,
    order: &mut [InstId],
    offsets: &FxHashMap<InstId, u64>,
) {
    let func = &module.funcs[segment.func];
    let respilled: FxHashSet<u64> = segment
        .spills
        .iter()
        .filter(|&&spill| is_respill(func, spill))
        .filter_map(|&spill| offset_of(func, spill))
        .collect();
    order.sort_by_key(|fill| respilled.contains(&offsets[fill]));
}

/// Returns `true` if `spill` writes back a fill of the same offset.
fn is_respill(func: &Function, spill: InstId) -> bool {
    let Some(RtInst::Spill { value, offset }) = func.dfg.rt(spill) else {
        return false;
    };
    func.dfg
        .value_inst(*value)
        .and_then(|inst| offset_of(func, inst).filter(|_| is_fill(func, inst)))
        == Some(*offset)
}

fn is_fill(func: &Function, inst: InstId) -> bool {
    matches!(func.dfg.rt(inst), Some(RtInst::Fill { .. }))
}

fn offset_of(func: &Function, inst: InstId) -> Option<u64> {
    match func.dfg.rt(inst)? {
        RtInst::Spill { offset, .. } | RtInst::Fill { offset, .. } => Some(*offset),
        _ => None,
    }
}

fn set_offset(func: &mut Function, inst: InstId, new_offset: u64) {
    func.dfg.update_inst(inst, |data| {
        if let Some(RtInst::Spill { offset, .. } | RtInst::Fill { offset, .. }) = data.rt_mut() {
            *offset = new_offset;
        }
    });
}

fn set_spill_size(func: &mut Function, suspend: InstId, size: u64) {
    func.dfg.update_inst(suspend, |data| match data.rt_mut() {
        Some(RtInst::TraceRay(data)) => data.spill_size = Some(size),
        Some(RtInst::CallShader(data)) => data.spill_size = Some(size),
        _ => {}
    });
}

/// Moves the entry fills into `order`, starting where the first of them
/// was. Fills have no operands so hoisting them is always legal.
fn reorder_fills(func: &mut Function, order: &[InstId]) {
    let Some(&first) = order
        .iter()
        .min_by_key(|&&fill| position_in_block(func, fill))
    else {
        return;
    };
    let block = func.layout.inst_block(first);
    let mut anchor = func.layout.prev_inst_of(first);
    for &fill in order {
        func.layout.remove_inst(fill);
    }
    for &fill in order {
        match anchor {
            Some(prev) => func.layout.insert_inst_after(fill, prev),
            None => func.layout.prepend_inst(fill, block),
        }
        anchor = Some(fill);
    }
}

/// Moves `spills` right before `suspend` in the given order.
fn reorder_spills(func: &mut Function, suspend: InstId, spills: impl Iterator<Item = InstId>) {
    for spill in spills {
        func.layout.remove_inst(spill);
        func.layout.insert_inst_before(spill, suspend);
    }
}

fn position_in_block(func: &Function, inst: InstId) -> usize {
    std::iter::successors(func.layout.prev_inst_of(inst), |&prev| {
        func.layout.prev_inst_of(prev)
    })
    .count()
}

/// Splits vector spills into one spill per element and rebuilds vector fills
/// from per-element fills.
fn expand_vectors(module: &mut Module, func_ref: FuncRef) -> bool {
    let func = &module.funcs[func_ref];
    let mut spills = Vec::new();
    let mut fills = Vec::new();
    for block in func.layout.iter_block() {
        for inst in func.layout.iter_inst(block) {
            match func.dfg.rt(inst) {
                Some(RtInst::Spill { value, offset }) => {
                    let ty = func.dfg.value_ty(*value);
                    if let Some((elem, len)) = module.types.vector_def(ty) {
                        spills.push((inst, *value, *offset, elem, len));
                    }
                }
                Some(RtInst::Fill { offset, ty }) => {
                    if let Some((elem, len)) = module.types.vector_def(*ty) {
                        fills.push((inst, *ty, *offset, elem, len));
                    }
                }
                _ => {}
            }
        }
    }
    let changed = !spills.is_empty() || !fills.is_empty();

    for (inst, value, offset, elem, len) in spills {
        let elem_size = module.types.size_of(elem) as u64;
        let mut builder = RtBuilder::before(module, func_ref, inst);
        for i in 0..len as u32 {
            let elem_value = builder.extract_element(value, i, elem);
            builder.spill(elem_value, offset + elem_size * i as u64);
        }
        erase_inst(&mut module.funcs[func_ref], inst);
    }

    for (inst, ty, offset, elem, len) in fills {
        let elem_size = module.types.size_of(elem) as u64;
        let mut builder = RtBuilder::before(module, func_ref, inst);
        let mut vec = builder.make_undef_value(ty);
        for i in 0..len as u32 {
            let elem_value = builder.fill(offset + elem_size * i as u64, elem);
            vec = builder.insert_element(vec, elem_value, i);
        }
        replace_with(module, InstRef::new(func_ref, inst), vec);
    }

    changed
}

/// Redirects the uses of the result of `inst` to `value` and erases `inst`.
fn replace_with(module: &mut Module, inst: InstRef, value: ValueId) {
    replace_inst_with(&mut module.funcs[inst.func], inst.inst, value);
}

fn fill_ty(module: &Module, fill: InstRef) -> Option<Type> {
    match module.funcs[fill.func].dfg.rt(fill.inst)? {
        RtInst::Fill { ty, .. } => Some(*ty),
        _ => None,
    }
}

/// Returns the address chain every spill of `fill` computes, if they all
/// compute the same one.
fn alloca_chain(
    module: &Module,
    info: &ContinuationInfo,
    numbers: &FxHashMap<InstId, u32>,
    fill: InstRef,
    spills: &[InstRef],
) -> Option<AddressChain> {
    // Only frame allocas live in global memory.
    if fill_ty(module, fill)? != GLOBAL_PTR {
        return None;
    }

    let mut chains = spills.iter().map(|spill| {
        let Some(RtInst::Spill { value, .. }) = module.funcs[spill.func].dfg.rt(spill.inst) else {
            return None;
        };
        address_chain(module, info, numbers, ValueRef::new(spill.func, *value))
    });

    let first = chains.next()??;
    for chain in chains {
        if chain? != first {
            return None;
        }
    }
    Some(first)
}

fn address_chain(
    module: &Module,
    info: &ContinuationInfo,
    numbers: &FxHashMap<InstId, u32>,
    value: ValueRef,
) -> Option<AddressChain> {
    let mut ops = Vec::new();
    let mut cur = value;

    let alloca = loop {
        let dfg = &module.funcs[cur.func].dfg;
        let inst = dfg.value_inst(cur.value)?;
        match dfg.inst(inst) {
            InstData::Gep {
                base,
                elem_ty,
                indices,
            } => {
                let indices: SmallVec<[Immediate; 4]> = indices
                    .iter()
                    .map(|idx| dfg.value_imm(*idx))
                    .collect::<Option<_>>()?;
                ops.push(ChainOp::Gep {
                    elem_ty: *elem_ty,
                    indices,
                });
                cur.value = *base;
            }
            InstData::Cast {
                code: CastOp::Bitcast,
                arg,
                ty,
            } => {
                ops.push(ChainOp::Bitcast { ty: *ty });
                cur.value = *arg;
            }
            InstData::Alloca {
                addr_space: AddrSpace::Global,
                ..
            } if cur.func == info.root() => break *numbers.get(&inst)?,
            InstData::Rt(RtInst::AllocaNumber { number }) => break *number,
            InstData::Rt(RtInst::Fill { .. }) => {
                let root = info.find_unique_spill_root(module, cur)?;
                if root == cur {
                    return None;
                }
                cur = root;
            }
            _ => return None,
        }
    };

    ops.reverse();
    Some(AddressChain { alloca, ops })
}

fn is_local_pointer(module: &Module, info: &ContinuationInfo, fill: InstRef) -> bool {
    if fill_ty(module, fill) != Some(CONST_PTR) {
        return false;
    }
    let Some(value) = module.funcs[fill.func].dfg.inst_result(fill.inst) else {
        return false;
    };

    info.find_unique_spill_root(module, ValueRef::new(fill.func, value))
        .is_some_and(|root| {
            let dfg = &module.funcs[root.func].dfg;
            dfg.value_inst(root.value)
                .is_some_and(|inst| matches!(dfg.rt(inst), Some(RtInst::LocalBufferPtr)))
        })
}

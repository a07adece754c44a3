//! Lowering of the ray-tracing placeholders of every shader group onto the
//! software stack and the asynchronous ray-tracing unit.
//!
//! Groups are lowered one at a time: the frame layout of the group is built
//! from all of its functions, then every function gets a prologue computing
//! its frame base and its placeholders are rewritten against that base.
//! Module wide state (the continuation merge helper, signposts and payload
//! offsets) is resolved once every group is done.
mod merge;
mod patch;
mod suspend;

pub use patch::strip_markers;

use indexmap::IndexSet;
use raystack_ir::{
    func_cursor::CursorLocation, inst::CmpOp, shader::HitGroupKind, FuncRef, Function, InstData,
    InstId, Module, RtInst, ShaderKind, Type, ValueId,
};
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, warn};

use crate::{
    cfg_edit::{erase_inst, replace_inst_with, CfgEditor},
    continuation::{continuation_group, root_functions, suspend_points, ContinuationMap, InstRef},
    context::RtContext,
    error::{LoweringError, LoweringResult},
    rt_builder::{RtBuilder, GLOBAL_PTR},
    rt_format::{async_stack, frame_args, HIT_KIND_TRIANGLE_BACK_FACE, HIT_KIND_TRIANGLE_FRONT_FACE},
    stack_frame::{global_allocas, StackFrameInfo},
};

/// Name of the helper every returning shader calls to resume its caller.
pub const MERGE_FUNC_NAME: &str = "__rt_merge_continuations";

pub struct IntrinsicLowering<'a> {
    ctx: &'a RtContext,
    /// Every continuation referenced from the module, keyed by ID.
    cont_ids: ContinuationMap,
    /// The only continuation of a whole program compilation, when its
    /// resume address is a constant.
    unique_cont: Option<(u32, FuncRef)>,
    merge_func: Option<FuncRef>,
    signposts: Vec<InstRef>,
    /// Frame offsets of the payloads passed to each continuation. `None`
    /// stands for a payload that is not at a constant frame offset.
    payload_offsets: FxHashMap<FuncRef, IndexSet<Option<u64>>>,
    /// Payload pointer stores into the frame of a callee.
    next_frame_stores: Vec<InstRef>,
}

impl<'a> IntrinsicLowering<'a> {
    pub fn new(ctx: &'a RtContext) -> Self {
        Self {
            ctx,
            cont_ids: ContinuationMap::default(),
            unique_cont: None,
            merge_func: None,
            signposts: Vec::new(),
            payload_offsets: FxHashMap::default(),
            next_frame_stores: Vec::new(),
        }
    }

    /// Lowers every shader group of `module`.
    #[instrument(level = "debug", skip_all)]
    pub fn run(&mut self, module: &mut Module) -> LoweringResult<()> {
        self.cont_ids = module_continuations(module);
        self.unique_cont = self.find_unique_continuation(module);

        for root in root_functions(module) {
            self.lower_group(module, root)?;
        }

        self.build_merge_func(module);
        self.patch_signposts(module);
        self.patch_payloads(module);
        Ok(())
    }

    /// The merge helper, once a returning shader needed it.
    pub fn merge_func(&self) -> Option<FuncRef> {
        self.merge_func
    }

    fn sinking_tried(&self) -> bool {
        self.ctx.config.payload_sinking && !self.ctx.payload_sinking_blocked
    }

    fn find_unique_continuation(&self, module: &Module) -> Option<(u32, FuncRef)> {
        let config = &self.ctx.config;
        if !self.sinking_tried() || !config.whole_program {
            return None;
        }
        // Addressed resumption needs the call stack handler to be patched.
        if config.indirect_continuations && !self.ctx.caps.call_stack_handler_patching {
            return None;
        }

        let mut conts = module.iter_functions().filter(|func| {
            module.is_continuation(*func) && !module.funcs[*func].is_declaration()
        });
        let cont = conts.next()?;
        if conts.next().is_some() || module.shader_info(cont)?.slot_num.is_some() {
            return None;
        }
        self.cont_ids
            .iter()
            .find(|(_, func)| **func == cont)
            .map(|(id, func)| (*id, *func))
    }

    fn lower_group(&mut self, module: &mut Module, root: FuncRef) -> LoweringResult<()> {
        let group = continuation_group(module, root);
        let mut frame = StackFrameInfo::new(module, self.ctx, root)?;

        // Continuations first, the root last.
        let mut funcs: IndexSet<FuncRef> = group.values().copied().collect();
        funcs.shift_remove(&root);
        funcs.insert(root);

        for &func in &funcs {
            frame.add_function(module, func)?;
        }
        frame.finalize(module)?;

        if let Some(info) = module.shader_info_mut(root) {
            info.stack_size = frame.frame_size();
        }
        for &cont in group.values() {
            if let Some(info) = module.shader_info_mut(cont) {
                info.parent = Some(root);
            }
        }

        for func in funcs {
            self.lower_function(module, &frame, func)?;
        }

        debug!(
            root = %module.func_name(root),
            frame_size = frame.frame_size(),
            continuations = group.len(),
            "lowered shader group"
        );
        Ok(())
    }

    fn lower_function(
        &mut self,
        module: &mut Module,
        frame: &StackFrameInfo,
        func: FuncRef,
    ) -> LoweringResult<()> {
        if module.funcs[func].is_declaration() {
            return Ok(());
        }

        let role = if func != frame.root() {
            FuncRole::Continuation
        } else if frame.kind() == ShaderKind::RayGen {
            FuncRole::RayGenRoot
        } else {
            FuncRole::Root
        };
        let hit_group = module
            .shader_info(frame.root())
            .map(|info| info.hit_group)
            .unwrap_or_default();
        let Some(prologue) = self.emit_prologue(module, frame, func, role) else {
            return Ok(());
        };
        let mut state = FuncState {
            func,
            role,
            kind: frame.kind(),
            hit_group,
            prologue,
            dims: [None; 3],
            indices: None,
        };
        if role == FuncRole::RayGenRoot {
            let indices = state.at_prologue(module, |builder| self.raygen_dispatch_indices(builder));
            state.indices = Some(indices);
        }

        self.lower_frame_addrs(module, &state);
        self.lower_dispatch_dimensions(module, &mut state);
        self.lower_alloca_numbers(module, frame, &state)?;
        if role != FuncRole::Continuation {
            self.lower_allocas(module, frame, &state)?;
        }
        self.lower_spills(module, frame, &state)?;
        self.lower_fills(module, frame, &state)?;
        self.emit_merge_calls(module, &state);
        self.lower_suspends(module, frame, &state);
        self.lower_payloads(module, &state);
        self.lower_hit_attributes(module, &state);
        self.lower_dispatch_indices(module, &mut state);
        self.lower_hit_kinds(module, &state);

        if role == FuncRole::RayGenRoot && self.ctx.config.dispatch_bounds_check {
            guard_dispatch_bounds(module, &mut state);
        }
        Ok(())
    }

    /// Computes the frame base at the top of the entry block.
    fn emit_prologue(
        &mut self,
        module: &mut Module,
        frame: &StackFrameInfo,
        func: FuncRef,
        role: FuncRole,
    ) -> Option<Prologue> {
        let entry = module.funcs[func].layout.entry_block()?;
        let mut builder = RtBuilder::at(module, func, CursorLocation::BlockTop(entry));

        let (frame_addr, frame_offset, cur_stack) = match role {
            FuncRole::RayGenRoot => {
                let base = builder.sw_stack_base();
                let zero = builder.make_imm_value(0i32);
                (base, zero, base)
            }
            FuncRole::Root => {
                let base = builder.sw_stack_base();
                let offset = builder.stack_offset();
                let frame_addr = builder.dynamic_offset_ptr(base, offset);
                (frame_addr, offset, frame_addr)
            }
            FuncRole::Continuation => {
                // The caller bumped the stack offset past our frame.
                let base = builder.sw_stack_base();
                let offset = builder.stack_offset();
                let cur_stack = builder.dynamic_offset_ptr(base, offset);
                let frame_size = builder.make_imm_value(frame.frame_size() as i32);
                let reset = builder.sub(offset, frame_size);
                let frame_addr = builder.dynamic_offset_ptr(base, reset);
                (frame_addr, reset, cur_stack)
            }
        };

        let frame_addr = if role == FuncRole::Continuation && self.sinking_tried() {
            let signpost = builder.rt(
                RtInst::Signpost {
                    frame_addr,
                    offset: None,
                },
                GLOBAL_PTR,
            );
            let inst = builder.last_inst()?;
            self.signposts.push(InstRef::new(func, inst));
            signpost
        } else {
            frame_addr
        };

        Some(Prologue {
            frame_addr,
            frame_offset,
            cur_stack,
            end: builder.last_inst()?,
        })
    }

    fn raygen_dispatch_indices(&self, builder: &mut RtBuilder) -> [ValueId; 3] {
        let lane = builder.lane_id();
        let group_x = builder.group_id(0);
        let group_y = builder.group_id(1);
        let group_z = builder.group_id(2);

        match self.ctx.config.custom_tiling {
            Some(tile) => {
                let width = builder.make_imm_value(tile.width() as i32);
                let height = builder.make_imm_value(tile.height() as i32);
                let lane_mask = builder.make_imm_value(tile.width() as i32 - 1);
                let log2_width = builder.make_imm_value(tile.log2_width as i32);

                let x_base = builder.mul(group_x, width);
                let x_lane = builder.and(lane, lane_mask);
                let x = builder.add(x_base, x_lane);
                let y_base = builder.mul(group_y, height);
                let y_lane = builder.lshr(lane, log2_width);
                let y = builder.add(y_base, y_lane);
                [x, y, group_z]
            }
            None => {
                let simd_width = builder.make_imm_value(self.ctx.caps.simd_width as i32);
                let x_base = builder.mul(group_x, simd_width);
                let x = builder.add(x_base, lane);
                [x, group_y, group_z]
            }
        }
    }

    fn lower_frame_addrs(&self, module: &mut Module, state: &FuncState) {
        let func = &mut module.funcs[state.func];
        for (inst, ()) in placeholders(func, |rt| matches!(rt, RtInst::FrameAddr).then_some(())) {
            replace_inst_with(func, inst, state.prologue.frame_addr);
        }
    }

    fn lower_dispatch_dimensions(&self, module: &mut Module, state: &mut FuncState) {
        let queries = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::DispatchDimensions { dim } => Some(*dim),
            _ => None,
        });
        for (inst, dim) in queries {
            let value = state.dimension(module, dim);
            replace_inst_with(&mut module.funcs[state.func], inst, value);
        }
    }

    fn lower_alloca_numbers(
        &self,
        module: &mut Module,
        frame: &StackFrameInfo,
        state: &FuncState,
    ) -> LoweringResult<()> {
        let numbers = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::AllocaNumber { number } => Some(*number),
            _ => None,
        });
        for (inst, number) in numbers {
            let mut builder = RtBuilder::before(module, state.func, inst);
            let addr = frame.get_alloca_ptr(&mut builder, state.prologue.frame_addr, number)?;
            replace_inst_with(builder.func_mut(), inst, addr);
        }
        Ok(())
    }

    fn lower_allocas(
        &self,
        module: &mut Module,
        frame: &StackFrameInfo,
        state: &FuncState,
    ) -> LoweringResult<()> {
        for inst in global_allocas(&module.funcs[state.func]) {
            let handle = InstRef::new(state.func, inst);
            let number = frame.alloca_number(handle).ok_or_else(|| {
                LoweringError::UnregisteredHandle {
                    func: module.func_name(state.func).to_string(),
                    kind: "alloca",
                }
            })?;
            let mut builder = RtBuilder::before(module, state.func, inst);
            let addr = frame.get_alloca_ptr(&mut builder, state.prologue.frame_addr, number)?;
            replace_inst_with(builder.func_mut(), inst, addr);
        }
        Ok(())
    }

    fn lower_spills(
        &self,
        module: &mut Module,
        frame: &StackFrameInfo,
        state: &FuncState,
    ) -> LoweringResult<()> {
        let spills = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::Spill { value, .. } => Some(*value),
            _ => None,
        });
        for (inst, value) in spills {
            let mut builder = RtBuilder::before(module, state.func, inst);
            let handle = InstRef::new(state.func, inst);
            let (addr, align) = frame.get_spill_ptr(&mut builder, state.prologue.frame_addr, handle)?;
            builder.store(addr, value, align);
            erase_inst(builder.func_mut(), inst);
        }
        Ok(())
    }

    fn lower_fills(
        &self,
        module: &mut Module,
        frame: &StackFrameInfo,
        state: &FuncState,
    ) -> LoweringResult<()> {
        let fills = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::Fill { ty, .. } => Some(*ty),
            _ => None,
        });
        for (inst, ty) in fills {
            let mut builder = RtBuilder::before(module, state.func, inst);
            let handle = InstRef::new(state.func, inst);
            let (addr, align) = frame.get_fill_ptr(&mut builder, state.prologue.frame_addr, handle)?;
            let value = builder.load(addr, ty, align);
            replace_inst_with(builder.func_mut(), inst, value);
        }
        Ok(())
    }

    fn lower_payloads(&self, module: &mut Module, state: &FuncState) {
        let payloads = placeholders(&module.funcs[state.func], |rt| {
            matches!(rt, RtInst::Payload).then_some(())
        });
        for (inst, ()) in payloads {
            let mut builder = RtBuilder::before(module, state.func, inst);
            let value = if state.kind.has_caller() {
                let frame_addr = state.prologue.frame_addr;
                let payload = builder.load_at(frame_addr, frame_args::PAYLOAD, GLOBAL_PTR);
                if state.role == FuncRole::Root && self.sinking_tried() {
                    builder.rt(
                        RtInst::PayloadPtr {
                            payload,
                            frame_addr,
                        },
                        GLOBAL_PTR,
                    )
                } else {
                    payload
                }
            } else {
                warn!(
                    func = %builder.module().func_name(state.func),
                    "raygen shader reads an incoming payload"
                );
                builder.make_undef_value(GLOBAL_PTR)
            };
            replace_inst_with(builder.func_mut(), inst, value);
        }
    }

    fn lower_hit_attributes(&self, module: &mut Module, state: &FuncState) {
        let attributes = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::HitAttribute { index, ty } => Some((*index, *ty)),
            _ => None,
        });
        for (inst, (index, ty)) in attributes {
            let mut builder = RtBuilder::before(module, state.func, inst);
            let word = 4 * index as i64;
            let value = match state.hit_group {
                HitGroupKind::Procedural => builder.load_at(
                    state.prologue.frame_addr,
                    frame_args::HIT_ATTRIBUTES + word,
                    ty,
                ),
                HitGroupKind::Triangles => {
                    let stack = builder.async_stack_ptr();
                    builder.load_at(stack, async_stack::COMMITTED_BARYCENTRICS + word, ty)
                }
            };
            replace_inst_with(builder.func_mut(), inst, value);
        }
    }

    fn lower_dispatch_indices(&self, module: &mut Module, state: &mut FuncState) {
        let queries = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::DispatchRayIndex { dim } => Some(*dim),
            _ => None,
        });
        if queries.is_empty() {
            return;
        }

        let indices = match state.indices {
            Some(indices) => indices,
            None => {
                let indices = state.at_prologue(module, |builder| {
                    [0, 1, 2].map(|dim| builder.stored_dispatch_index(dim))
                });
                state.indices = Some(indices);
                indices
            }
        };
        for (inst, dim) in queries {
            let value = indices[usize::from(dim.min(2))];
            replace_inst_with(&mut module.funcs[state.func], inst, value);
        }
    }

    fn lower_hit_kinds(&self, module: &mut Module, state: &FuncState) {
        let queries = placeholders(&module.funcs[state.func], |rt| {
            matches!(rt, RtInst::HitKind).then_some(())
        });
        for (inst, ()) in queries {
            let mut builder = RtBuilder::before(module, state.func, inst);
            let value = match state.hit_group {
                HitGroupKind::Procedural => {
                    builder.load_at(state.prologue.frame_addr, frame_args::HIT_KIND, Type::I32)
                }
                HitGroupKind::Triangles => {
                    let stack = builder.async_stack_ptr();
                    let info = builder.load_at(stack, async_stack::COMMITTED_HIT_INFO, Type::I32);
                    let bit = builder.make_imm_value(async_stack::FRONT_FACE_BIT);
                    let masked = builder.and(info, bit);
                    let zero = builder.make_imm_value(0i32);
                    let front_face = builder.cmp(CmpOp::Ne, masked, zero);
                    let front = builder.make_imm_value(HIT_KIND_TRIANGLE_FRONT_FACE);
                    let back = builder.make_imm_value(HIT_KIND_TRIANGLE_BACK_FACE);
                    builder.select(front_face, front, back)
                }
            };
            replace_inst_with(builder.func_mut(), inst, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncRole {
    RayGenRoot,
    Root,
    Continuation,
}

/// Values defined at the top of the entry block that the lowered
/// placeholders of a function build on.
#[derive(Debug, Clone, Copy)]
struct Prologue {
    frame_addr: ValueId,
    /// Stack offset of `frame_addr` (`i32`).
    frame_offset: ValueId,
    /// Stack top on entry. Only differs from `frame_addr` in continuations,
    /// whose callee frames start there.
    cur_stack: ValueId,
    /// Last instruction of the prologue.
    end: InstId,
}

struct FuncState {
    func: FuncRef,
    role: FuncRole,
    kind: ShaderKind,
    hit_group: HitGroupKind,
    prologue: Prologue,
    dims: [Option<ValueId>; 3],
    indices: Option<[ValueId; 3]>,
}

impl FuncState {
    /// Runs `f` with a builder appending to the prologue.
    fn at_prologue<R>(&mut self, module: &mut Module, f: impl FnOnce(&mut RtBuilder) -> R) -> R {
        let mut builder = RtBuilder::at(module, self.func, CursorLocation::At(self.prologue.end));
        let result = f(&mut builder);
        if let Some(end) = builder.last_inst() {
            self.prologue.end = end;
        }
        result
    }

    fn dimension(&mut self, module: &mut Module, dim: u8) -> ValueId {
        let slot = usize::from(dim.min(2));
        if let Some(value) = self.dims[slot] {
            return value;
        }
        let value = self.at_prologue(module, |builder| builder.dispatch_dimension(slot as u8));
        self.dims[slot] = Some(value);
        value
    }
}

/// Placeholders of `func` picked by `select`, in layout order.
fn placeholders<T>(
    func: &Function,
    mut select: impl FnMut(&RtInst) -> Option<T>,
) -> Vec<(InstId, T)> {
    func.rt_insts()
        .filter_map(|(inst, rt)| Some((inst, select(rt)?)))
        .collect()
}

/// Every continuation referenced from a suspension point of `module`.
fn module_continuations(module: &Module) -> ContinuationMap {
    let mut conts = ContinuationMap::default();
    for func in module.iter_functions() {
        for (_, cont) in suspend_points(&module.funcs[func]) {
            conts.entry(cont.id).or_insert(cont.func);
        }
    }
    conts.sort_keys();
    conts
}

/// Sends lanes outside the dispatch dimensions straight to an exit that
/// releases their stack.
fn guard_dispatch_bounds(module: &mut Module, state: &mut FuncState) {
    let Some([x, y, _]) = state.indices else {
        return;
    };
    let width = state.dimension(module, 0);
    let height = state.dimension(module, 1);

    let func = &mut module.funcs[state.func];
    let Some(entry) = func.layout.entry_block() else {
        return;
    };
    let body = CfgEditor::new(func).split_block_after(state.prologue.end);
    let exit = func.dfg.make_block();
    func.layout.append_block(exit);

    let mut builder = RtBuilder::at(module, state.func, CursorLocation::BlockBottom(entry));
    let x_in_bounds = builder.cmp(CmpOp::Ult, x, width);
    let y_in_bounds = builder.cmp(CmpOp::Ult, y, height);
    let in_bounds = builder.and(x_in_bounds, y_in_bounds);
    builder.br(in_bounds, body, exit);

    builder.switch_to_block(exit);
    builder.stack_id_release();
    builder.ret(None);
}

/// Returns `true` if `inst` is a return of `func`.
fn is_return(func: &Function, inst: InstId) -> bool {
    matches!(func.dfg.inst(inst), InstData::Return { .. })
}

#[cfg(test)]
mod tests;

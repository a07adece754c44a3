use raystack_ir::{
    inst::{CallShaderData, CastOp, ContRef, TraceCtrl, TraceRayData},
    types::TypeStore,
    Function, InstData, Module, RtInst, Type, ValueId,
};
use smallvec::SmallVec;

use super::{placeholders, FuncRole, FuncState, IntrinsicLowering};
use crate::{
    cfg_edit::erase_inst,
    continuation::InstRef,
    rt_builder::RtBuilder,
    rt_format::{async_stack, dispatch_globals, frame_args, SHADER_IDENTIFIER_SLOT_SIZE},
    stack_frame::StackFrameInfo,
};

const RAY_FLAGS_MASK: i32 = 0xFFFF;
const INSTANCE_MASK_MASK: i32 = 0xFF;
const CONTRIBUTION_MASK: i32 = 0xF;
const MULTIPLIER_MASK: i32 = 0xF;
const MISS_INDEX_MASK: i32 = 0xFFFF;

enum Suspend {
    Trace(TraceRayData),
    Call(CallShaderData),
}

impl Suspend {
    fn payload(&self) -> ValueId {
        match self {
            Self::Trace(data) => data.payload,
            Self::Call(data) => data.payload,
        }
    }

    fn cont(&self) -> ContRef {
        match self {
            Self::Trace(data) => data.cont,
            Self::Call(data) => data.cont,
        }
    }

    fn spill_size(&self) -> Option<u64> {
        match self {
            Self::Trace(data) => data.spill_size,
            Self::Call(data) => data.spill_size,
        }
    }
}

impl IntrinsicLowering<'_> {
    /// Replaces every trace and call-shader placeholder with the sequence
    /// handing the lane over to the ray-tracing unit.
    ///
    /// Everything the callee reads is written before the dispatch, and the
    /// stack offset is bumped before the first write into the next frame.
    pub(super) fn lower_suspends(
        &mut self,
        module: &mut Module,
        frame: &StackFrameInfo,
        state: &FuncState,
    ) {
        let suspends = placeholders(&module.funcs[state.func], |rt| match rt {
            RtInst::TraceRay(data) => Some(Suspend::Trace(data.clone())),
            RtInst::CallShader(data) => Some(Suspend::Call(data.clone())),
            _ => None,
        });

        for (inst, suspend) in suspends {
            let cont = suspend.cont();
            let payload = suspend.payload();
            let mut builder = RtBuilder::before(module, state.func, inst);

            if let Some(spill_size) = suspend.spill_size() {
                pad_spill_region(&mut builder, frame, state, spill_size);
            }
            if let Suspend::Trace(data) = &suspend {
                write_ray_record(&mut builder, data);
            }
            if let (FuncRole::RayGenRoot, Some(indices)) = (state.role, state.indices) {
                for (dim, index) in indices.into_iter().enumerate() {
                    builder.store_dispatch_index(dim as u8, index);
                }
            }

            let next_frame = match state.role {
                FuncRole::Continuation => state.prologue.cur_stack,
                FuncRole::RayGenRoot | FuncRole::Root => {
                    let frame_size = builder.make_imm_value(frame.frame_size() as i32);
                    let new_offset = builder.add(state.prologue.frame_offset, frame_size);
                    builder.set_stack_offset(new_offset);
                    builder.offset_ptr(state.prologue.frame_addr, frame.frame_size() as i64)
                }
            };

            if self.writes_resume_address(state, cont) {
                let resume = self.resume_address(&mut builder, cont);
                builder.store_at(next_frame, frame_args::RETURN_IP, resume);
            }
            if self.sinking_tried() {
                let offset = frame_offset_of(
                    builder.func(),
                    builder.types(),
                    payload,
                    state.prologue.frame_addr,
                );
                self.payload_offsets
                    .entry(cont.func)
                    .or_default()
                    .insert(offset);
            }
            let store = builder.store_at(next_frame, frame_args::PAYLOAD, payload);
            self.next_frame_stores.push(InstRef::new(state.func, store));

            match &suspend {
                Suspend::Trace(_) => {
                    builder.trace_ray_async(TraceCtrl::Initial);
                }
                Suspend::Call(data) => {
                    let globals = builder.dispatch_globals_ptr();
                    let addr = builder.shader_table_addr(
                        globals,
                        dispatch_globals::CALLABLE_BASE,
                        dispatch_globals::CALLABLE_STRIDE,
                        data.shader_index,
                    );
                    builder.btd_call(addr);
                }
            }
            erase_inst(builder.func_mut(), inst);
        }
    }

    fn writes_resume_address(&self, state: &FuncState, cont: ContRef) -> bool {
        if self.unique_cont.is_some() {
            return false;
        }
        // A continuation resuming itself finds its own address in place.
        !self.ctx.config.rt_stack_opts
            || state.role != FuncRole::Continuation
            || cont.func != state.func
    }

    /// Address the ray-tracing unit resumes `cont` at, or its ID when
    /// continuations are resumed through the merge switch.
    pub(super) fn resume_address(&self, builder: &mut RtBuilder, cont: ContRef) -> ValueId {
        if !self.ctx.config.indirect_continuations {
            return builder.make_imm_value(i64::from(cont.id));
        }

        let slot = builder
            .module()
            .shader_info(cont.func)
            .and_then(|info| info.slot_num);
        let addr = match slot {
            Some(slot) => {
                let local_buffer = builder.local_buffer_ptr();
                let back = self.ctx.caps.shader_identifier_slots.saturating_sub(slot);
                builder.offset_ptr(local_buffer, -(i64::from(back) * SHADER_IDENTIFIER_SLOT_SIZE))
            }
            None => builder.shader_record_ptr(cont.func),
        };
        builder.cast(CastOp::PtrToInt, addr, Type::I64)
    }
}

/// Fills the frame between the live spills and the frame end with anchors.
fn pad_spill_region(
    builder: &mut RtBuilder,
    frame: &StackFrameInfo,
    state: &FuncState,
    spill_size: u64,
) {
    let pad_start = frame.spill_offset() + spill_size;
    let gap = frame.frame_size().saturating_sub(pad_start);
    if gap == 0 || gap % 4 != 0 {
        return;
    }

    let anchor = builder.spill_anchor();
    for word in 0..gap / 4 {
        let offset = (pad_start + 4 * word) as i64;
        builder.store_at(state.prologue.frame_addr, offset, anchor);
    }
}

fn write_ray_record(builder: &mut RtBuilder, data: &TraceRayData) {
    let stack = builder.async_stack_ptr();
    for (index, value) in data.ray_info.iter().enumerate() {
        builder.store_at(stack, async_stack::ray_info_offset(index), *value);
    }
    builder.store_at(stack, ray_field(async_stack::ROOT_NODE), data.accel);

    let flags = masked(builder, data.ray_flags, RAY_FLAGS_MASK);
    builder.store_at(stack, ray_field(async_stack::RAY_FLAGS), flags);
    let instance_mask = masked(builder, data.instance_mask, INSTANCE_MASK_MASK);
    builder.store_at(stack, ray_field(async_stack::INSTANCE_MASK), instance_mask);

    let globals = builder.dispatch_globals_ptr();
    let contribution = masked(builder, data.ray_contribution, CONTRIBUTION_MASK);
    let hit_group = builder.shader_table_addr(
        globals,
        dispatch_globals::HIT_GROUP_BASE,
        dispatch_globals::HIT_GROUP_STRIDE,
        contribution,
    );
    builder.store_at(stack, ray_field(async_stack::HIT_GROUP_RECORD), hit_group);
    let multiplier = masked(builder, data.geometry_multiplier, MULTIPLIER_MASK);
    builder.store_at(stack, ray_field(async_stack::GEOMETRY_STRIDE), multiplier);

    let miss_index = masked(builder, data.miss_index, MISS_INDEX_MASK);
    let miss = builder.shader_table_addr(
        globals,
        dispatch_globals::MISS_BASE,
        dispatch_globals::MISS_STRIDE,
        miss_index,
    );
    builder.store_at(stack, ray_field(async_stack::MISS_RECORD), miss);
}

fn ray_field(offset: i64) -> i64 {
    async_stack::MEM_RAY + offset
}

fn masked(builder: &mut RtBuilder, value: ValueId, mask: i32) -> ValueId {
    let mask = builder.make_imm_value(mask);
    builder.and(value, mask)
}

/// Byte offset of `value` from `frame_addr` when it is reached through
/// constant address arithmetic only.
pub(super) fn frame_offset_of(
    func: &Function,
    types: &TypeStore,
    mut value: ValueId,
    frame_addr: ValueId,
) -> Option<u64> {
    let mut offset = 0i64;
    while value != frame_addr {
        let inst = func.dfg.value_inst(value)?;
        match func.dfg.inst(inst) {
            InstData::Gep {
                base,
                elem_ty,
                indices,
            } => {
                let indices = indices
                    .iter()
                    .map(|idx| func.dfg.value_imm(*idx)?.as_i64())
                    .collect::<Option<SmallVec<[i64; 4]>>>()?;
                offset += types.gep_offset(*elem_ty, &indices)?.0;
                value = *base;
            }
            InstData::Cast {
                code: CastOp::Bitcast,
                arg,
                ..
            } => value = *arg,
            _ => return None,
        }
    }
    u64::try_from(offset).ok()
}

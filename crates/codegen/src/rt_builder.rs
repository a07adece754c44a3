//! Builder for the hardware facing sequences emitted by the lowering.
use std::ops::{Deref, DerefMut};

use raystack_ir::{
    builder::FunctionBuilder,
    func_cursor::{CursorLocation, FuncCursor, InstInserter},
    inst::{CastOp, TraceCtrl},
    AddrSpace, FuncRef, InstId, Module, RtInst, Type, ValueId,
};

use crate::rt_format::{async_stack, dispatch_globals, hot_zone};

pub const GLOBAL_PTR: Type = Type::Ptr(AddrSpace::Global);
pub const CONST_PTR: Type = Type::Ptr(AddrSpace::Constant);

pub struct RtBuilder<'a> {
    builder: FunctionBuilder<'a, InstInserter>,
}

impl<'a> RtBuilder<'a> {
    pub fn at(module: &'a mut Module, func: FuncRef, loc: CursorLocation) -> Self {
        let cursor = InstInserter::at_location(loc);
        Self {
            builder: FunctionBuilder::new(module, func, cursor),
        }
    }

    /// Builder inserting right before `inst`.
    pub fn before(module: &'a mut Module, func: FuncRef, inst: InstId) -> Self {
        let cursor = InstInserter::before(&module.funcs[func], inst);
        Self {
            builder: FunctionBuilder::new(module, func, cursor),
        }
    }

    pub fn hot_zone_ptr(&mut self) -> ValueId {
        self.rt(RtInst::HotZonePtr, GLOBAL_PTR)
    }

    pub fn async_stack_ptr(&mut self) -> ValueId {
        self.rt(RtInst::AsyncStackPtr, GLOBAL_PTR)
    }

    pub fn dispatch_globals_ptr(&mut self) -> ValueId {
        self.rt(RtInst::DispatchGlobalsPtr, CONST_PTR)
    }

    pub fn sw_stack_base(&mut self) -> ValueId {
        self.rt(RtInst::SwStackBase, GLOBAL_PTR)
    }

    pub fn shader_record_ptr(&mut self, func: FuncRef) -> ValueId {
        self.rt(RtInst::ShaderRecordPtr { func }, CONST_PTR)
    }

    pub fn group_id(&mut self, dim: u8) -> ValueId {
        self.rt(RtInst::GroupId { dim }, Type::I32)
    }

    pub fn lane_id(&mut self) -> ValueId {
        self.rt(RtInst::LaneId, Type::I32)
    }

    pub fn spill_anchor(&mut self) -> ValueId {
        self.rt(RtInst::SpillAnchor, Type::I32)
    }

    pub fn trace_ray_async(&mut self, ctrl: TraceCtrl) -> InstId {
        self.rt_no_result(RtInst::TraceRayAsync { ctrl })
    }

    pub fn btd_call(&mut self, addr: ValueId) -> InstId {
        self.rt_no_result(RtInst::BtdCall { addr })
    }

    pub fn stack_id_release(&mut self) -> InstId {
        self.rt_no_result(RtInst::StackIdRelease)
    }

    /// Address `offset` bytes past `base`.
    pub fn offset_ptr(&mut self, base: ValueId, offset: i64) -> ValueId {
        if offset == 0 {
            base
        } else {
            self.byte_offset(base, offset)
        }
    }

    /// Address `offset` bytes past `base` for a dynamic `i32` offset.
    pub fn dynamic_offset_ptr(&mut self, base: ValueId, offset: ValueId) -> ValueId {
        let offset = self.cast(CastOp::Zext, offset, Type::I64);
        self.gep(base, Type::I8, &[offset])
    }

    pub fn load_at(&mut self, base: ValueId, offset: i64, ty: Type) -> ValueId {
        let align = self.natural_align(ty);
        let addr = self.offset_ptr(base, offset);
        self.load(addr, ty, align)
    }

    pub fn store_at(&mut self, base: ValueId, offset: i64, value: ValueId) -> InstId {
        let ty = self.type_of(value);
        let align = self.natural_align(ty);
        let addr = self.offset_ptr(base, offset);
        self.store(addr, value, align)
    }

    /// Current offset of the software stack of the lane.
    pub fn stack_offset(&mut self) -> ValueId {
        let hot_zone = self.hot_zone_ptr();
        self.load_at(hot_zone, hot_zone::STACK_OFFSET, Type::I32)
    }

    pub fn set_stack_offset(&mut self, offset: ValueId) -> InstId {
        let hot_zone = self.hot_zone_ptr();
        self.store_at(hot_zone, hot_zone::STACK_OFFSET, offset)
    }

    pub fn stored_dispatch_index(&mut self, dim: u8) -> ValueId {
        let hot_zone = self.hot_zone_ptr();
        self.load_at(hot_zone, hot_zone::DISPATCH_INDEX + 4 * dim as i64, Type::I32)
    }

    pub fn store_dispatch_index(&mut self, dim: u8, index: ValueId) -> InstId {
        let hot_zone = self.hot_zone_ptr();
        self.store_at(hot_zone, hot_zone::DISPATCH_INDEX + 4 * dim as i64, index)
    }

    pub fn dispatch_dimension(&mut self, dim: u8) -> ValueId {
        let globals = self.dispatch_globals_ptr();
        self.load_at(
            globals,
            dispatch_globals::DIMENSIONS + 4 * dim as i64,
            Type::I32,
        )
    }

    /// Reads a ray info field the ray-tracing unit left untouched.
    pub fn ray_info_field(&mut self, index: usize) -> ValueId {
        debug_assert_ne!(index, async_stack::TMAX_INDEX);
        let stack = self.async_stack_ptr();
        self.load_at(stack, async_stack::ray_info_offset(index), Type::F32)
    }

    /// Computes `base + stride * index` from a base/stride pair of the
    /// dispatch globals.
    pub fn shader_table_addr(
        &mut self,
        globals: ValueId,
        base_offset: i64,
        stride_offset: i64,
        index: ValueId,
    ) -> ValueId {
        let base = self.load_at(globals, base_offset, Type::I64);
        let stride = self.load_at(globals, stride_offset, Type::I32);
        let scaled = self.mul(stride, index);
        let scaled = self.cast(CastOp::Zext, scaled, Type::I64);
        self.add(base, scaled)
    }

    fn natural_align(&self, ty: Type) -> u32 {
        self.types().align_of(ty).min(16) as u32
    }
}

impl<'a> Deref for RtBuilder<'a> {
    type Target = FunctionBuilder<'a, InstInserter>;

    fn deref(&self) -> &Self::Target {
        &self.builder
    }
}

impl DerefMut for RtBuilder<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.builder
    }
}

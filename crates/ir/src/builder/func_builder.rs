use smallvec::SmallVec;

use crate::{
    func_cursor::{CursorLocation, FuncCursor},
    inst::{
        BinaryOp, CallShaderData, CastOp, CmpOp, InstData, RtInst, TraceRayData,
    },
    module::FuncRef,
    types::TypeStore,
    AddrSpace, BlockId, Function, Immediate, InstId, Module, Type, ValueId,
};

/// Builds or extends the body of one function of a module.
pub struct FunctionBuilder<'a, C> {
    module: &'a mut Module,
    func_ref: FuncRef,
    pub cursor: C,
}

impl<'a, C> FunctionBuilder<'a, C>
where
    C: FuncCursor,
{
    pub fn new(module: &'a mut Module, func_ref: FuncRef, cursor: C) -> Self {
        Self {
            module,
            func_ref,
            cursor,
        }
    }

    pub fn func_ref(&self) -> FuncRef {
        self.func_ref
    }

    pub fn func(&self) -> &Function {
        &self.module.funcs[self.func_ref]
    }

    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.module.funcs[self.func_ref]
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    pub fn types(&self) -> &TypeStore {
        &self.module.types
    }

    pub fn types_mut(&mut self) -> &mut TypeStore {
        &mut self.module.types
    }

    pub fn append_block(&mut self) -> BlockId {
        let func = &mut self.module.funcs[self.func_ref];
        let block = self.cursor.make_block(func);
        self.cursor.append_block(func, block);
        block
    }

    pub fn make_block(&mut self) -> BlockId {
        let func = &mut self.module.funcs[self.func_ref];
        self.cursor.make_block(func)
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.cursor.set_location(CursorLocation::BlockBottom(block));
    }

    pub fn set_location(&mut self, loc: CursorLocation) {
        self.cursor.set_location(loc);
    }

    /// Positions the builder so the next instruction lands before `inst`.
    pub fn set_before(&mut self, inst: InstId) {
        let func = &self.module.funcs[self.func_ref];
        self.cursor.set_before(func, inst);
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> ValueId
    where
        Imm: Into<Immediate>,
    {
        self.func_mut().dfg.make_imm_value(imm)
    }

    pub fn make_undef_value(&mut self, ty: Type) -> ValueId {
        self.func_mut().dfg.make_undef_value(ty)
    }

    pub fn args(&self) -> &[ValueId] {
        &self.func().arg_values
    }

    pub fn type_of(&self, value: ValueId) -> Type {
        self.func().dfg.value_ty(value)
    }

    pub fn current_block(&self) -> Option<BlockId> {
        self.cursor.block(self.func())
    }

    pub fn last_inst(&self) -> Option<InstId> {
        self.cursor.inst()
    }

    /// Inserts an instruction at the current position and returns its
    /// result value of type `ret_ty`.
    pub fn insert_inst(&mut self, data: InstData, ret_ty: Type) -> ValueId {
        let func = &mut self.module.funcs[self.func_ref];
        self.cursor.insert_inst_data_with_result(func, data, ret_ty)
    }

    /// Inserts an instruction without creating a result value.
    pub fn insert_inst_no_result(&mut self, data: InstData) -> InstId {
        let func = &mut self.module.funcs[self.func_ref];
        self.cursor.insert_inst_data(func, data)
    }

    pub fn binary(&mut self, code: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.type_of(lhs);
        self.insert_inst(
            InstData::Binary {
                code,
                args: [lhs, rhs],
            },
            ty,
        )
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    pub fn shl(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Shl, lhs, rhs)
    }

    pub fn lshr(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Lshr, lhs, rhs)
    }

    pub fn fadd(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::FAdd, lhs, rhs)
    }

    pub fn cmp(&mut self, code: CmpOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.insert_inst(
            InstData::Cmp {
                code,
                args: [lhs, rhs],
            },
            Type::I1,
        )
    }

    pub fn cast(&mut self, code: CastOp, arg: ValueId, ty: Type) -> ValueId {
        self.insert_inst(InstData::Cast { code, arg, ty }, ty)
    }

    pub fn select(&mut self, cond: ValueId, then_val: ValueId, else_val: ValueId) -> ValueId {
        let ty = self.type_of(then_val);
        self.insert_inst(
            InstData::Select {
                cond,
                then_val,
                else_val,
            },
            ty,
        )
    }

    pub fn extract_element(&mut self, vec: ValueId, idx: u32, elem_ty: Type) -> ValueId {
        self.insert_inst(InstData::ExtractElement { vec, idx }, elem_ty)
    }

    pub fn insert_element(&mut self, vec: ValueId, elem: ValueId, idx: u32) -> ValueId {
        let ty = self.type_of(vec);
        self.insert_inst(InstData::InsertElement { vec, elem, idx }, ty)
    }

    pub fn alloca(&mut self, ty: Type, addr_space: AddrSpace) -> ValueId {
        self.insert_inst(InstData::Alloca { ty, addr_space }, Type::Ptr(addr_space))
    }

    pub fn load(&mut self, addr: ValueId, ty: Type, align: u32) -> ValueId {
        self.insert_inst(InstData::Load { addr, ty, align }, ty)
    }

    pub fn store(&mut self, addr: ValueId, value: ValueId, align: u32) -> InstId {
        self.insert_inst_no_result(InstData::Store { addr, value, align })
    }

    /// Address computation; the result keeps the address space of `base`.
    pub fn gep(&mut self, base: ValueId, elem_ty: Type, indices: &[ValueId]) -> ValueId {
        let ty = self.type_of(base);
        self.insert_inst(
            InstData::Gep {
                base,
                elem_ty,
                indices: indices.into(),
            },
            ty,
        )
    }

    /// Address computation with `i32` constant indices.
    pub fn gep_const(&mut self, base: ValueId, elem_ty: Type, indices: &[i32]) -> ValueId {
        let indices: SmallVec<[ValueId; 4]> = indices
            .iter()
            .map(|&idx| self.make_imm_value(idx))
            .collect();
        self.gep(base, elem_ty, &indices)
    }

    /// Byte offset from `base`.
    pub fn byte_offset(&mut self, base: ValueId, offset: i64) -> ValueId {
        let offset = self.make_imm_value(offset);
        self.gep(base, Type::I8, &[offset])
    }

    pub fn call(&mut self, callee: FuncRef, args: &[ValueId]) -> Option<ValueId> {
        let ret_ty = self.module.funcs[callee].sig.ret_ty();
        let data = InstData::Call {
            callee,
            args: args.into(),
            ret_ty,
        };
        if ret_ty.is_unit() {
            self.insert_inst_no_result(data);
            None
        } else {
            Some(self.insert_inst(data, ret_ty))
        }
    }

    pub fn phi(&mut self, args: &[(ValueId, BlockId)]) -> ValueId {
        let ty = self.type_of(args[0].0);
        self.insert_inst(
            InstData::Phi {
                args: args.into(),
                ty,
            },
            ty,
        )
    }

    pub fn jump(&mut self, dest: BlockId) -> InstId {
        self.insert_inst_no_result(InstData::Jump { dest })
    }

    pub fn br(&mut self, cond: ValueId, then_dest: BlockId, else_dest: BlockId) -> InstId {
        self.insert_inst_no_result(InstData::Br {
            cond,
            then_dest,
            else_dest,
        })
    }

    pub fn switch(
        &mut self,
        scrutinee: ValueId,
        default: BlockId,
        table: &[(u64, BlockId)],
    ) -> InstId {
        self.insert_inst_no_result(InstData::Switch {
            scrutinee,
            default,
            table: table.into(),
        })
    }

    pub fn ret(&mut self, arg: Option<ValueId>) -> InstId {
        self.insert_inst_no_result(InstData::Return { arg })
    }

    pub fn unreachable(&mut self) -> InstId {
        self.insert_inst_no_result(InstData::Unreachable)
    }

    pub fn rt(&mut self, inst: RtInst, ty: Type) -> ValueId {
        self.insert_inst(InstData::Rt(inst), ty)
    }

    pub fn rt_no_result(&mut self, inst: RtInst) -> InstId {
        self.insert_inst_no_result(InstData::Rt(inst))
    }

    pub fn spill(&mut self, value: ValueId, offset: u64) -> InstId {
        self.rt_no_result(RtInst::Spill { value, offset })
    }

    pub fn fill(&mut self, offset: u64, ty: Type) -> ValueId {
        self.rt(RtInst::Fill { offset, ty }, ty)
    }

    pub fn trace_ray(&mut self, data: TraceRayData) -> InstId {
        self.rt_no_result(RtInst::TraceRay(data))
    }

    pub fn call_shader(&mut self, data: CallShaderData) -> InstId {
        self.rt_no_result(RtInst::CallShader(data))
    }

    pub fn payload(&mut self) -> ValueId {
        self.rt(RtInst::Payload, Type::Ptr(AddrSpace::Global))
    }

    pub fn frame_addr(&mut self) -> ValueId {
        self.rt(RtInst::FrameAddr, Type::Ptr(AddrSpace::Global))
    }

    pub fn alloca_number(&mut self, number: u32) -> ValueId {
        self.rt(RtInst::AllocaNumber { number }, Type::Ptr(AddrSpace::Global))
    }

    pub fn dispatch_ray_index(&mut self, dim: u8) -> ValueId {
        self.rt(RtInst::DispatchRayIndex { dim }, Type::I32)
    }

    pub fn dispatch_dimensions(&mut self, dim: u8) -> ValueId {
        self.rt(RtInst::DispatchDimensions { dim }, Type::I32)
    }

    pub fn hit_kind(&mut self) -> ValueId {
        self.rt(RtInst::HitKind, Type::I32)
    }

    pub fn hit_attribute(&mut self, index: u32, ty: Type) -> ValueId {
        self.rt(RtInst::HitAttribute { index, ty }, ty)
    }

    pub fn local_buffer_ptr(&mut self) -> ValueId {
        self.rt(RtInst::LocalBufferPtr, Type::Ptr(AddrSpace::Constant))
    }
}

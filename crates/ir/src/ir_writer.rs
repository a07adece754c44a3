use std::io;

use crate::{
    inst::{InstData, RtInst},
    module::FuncRef,
    AddrSpace, BlockId, Function, InstId, Module, Value, ValueId,
};

pub struct ModuleWriter<'a> {
    module: &'a Module,
}

impl<'a> ModuleWriter<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    pub fn write(&mut self, mut w: impl io::Write) -> io::Result<()> {
        writeln!(w, "target = \"{}\"", self.module.triple)?;

        // Write struct types defined in the module.
        for def in self.module.types.all_struct_data() {
            write!(w, "type %{} = ", def.name)?;
            if def.packed {
                write!(w, "<")?;
            }
            write!(w, "{{")?;
            let fields: Vec<_> = def
                .fields
                .iter()
                .map(|ty| self.module.types.display(*ty))
                .collect();
            write!(w, "{}", fields.join(", "))?;
            write!(w, "}}")?;
            if def.packed {
                write!(w, ">")?;
            }
            writeln!(w, ";")?;
        }
        writeln!(w)?;

        for func_ref in self.module.funcs.keys() {
            let mut func_writer = FuncWriter::new(self.module, func_ref);
            func_writer.write(&mut w)?;
            writeln!(w)?;
        }

        Ok(())
    }

    pub fn dump_string(&mut self) -> io::Result<String> {
        let mut s = Vec::new();
        self.write(&mut s)?;
        Ok(String::from_utf8_lossy(&s).into_owned())
    }
}

pub struct FuncWriter<'a> {
    module: &'a Module,
    func_ref: FuncRef,
    func: &'a Function,
    level: u8,
}

impl<'a> FuncWriter<'a> {
    pub fn new(module: &'a Module, func_ref: FuncRef) -> Self {
        Self {
            module,
            func_ref,
            func: &module.funcs[func_ref],
            level: 0,
        }
    }

    pub fn write(&mut self, mut w: impl io::Write) -> io::Result<()> {
        if let Some(info) = self.module.shader_info(self.func_ref) {
            write!(w, "#[shader({}", info.kind)?;
            if let Some(parent) = info.parent {
                write!(w, ", continuation of %{}", self.module.func_name(parent))?;
            }
            writeln!(w, ")]")?;
        }

        write!(w, "func %{}(", self.func.sig.name())?;
        let args: Vec<_> = self
            .func
            .arg_values
            .iter()
            .map(|&arg| self.value_with_ty(arg))
            .collect();
        write!(w, "{}", args.join(", "))?;
        write!(
            w,
            ") -> {}",
            self.module.types.display(self.func.sig.ret_ty())
        )?;

        if self.func.is_declaration() {
            return writeln!(w, ";");
        }

        writeln!(w, " {{")?;
        self.level += 1;

        let mut blocks = self.func.layout.iter_block().peekable();
        while let Some(block) = blocks.next() {
            self.write_block_with_inst(block, &mut w)?;
            if blocks.peek().is_some() {
                self.newline(&mut w)?;
            }
        }

        self.level -= 1;
        writeln!(w, "}}")
    }

    pub fn dump_string(&mut self) -> io::Result<String> {
        let mut s = Vec::new();
        self.write(&mut s)?;
        Ok(String::from_utf8_lossy(&s).into_owned())
    }

    pub fn write_block_with_inst(
        &mut self,
        block: BlockId,
        mut w: impl io::Write,
    ) -> io::Result<()> {
        self.indent(&mut w)?;
        writeln!(w, "{block}:")?;

        self.level += 1;
        for inst in self.func.layout.iter_inst(block) {
            self.indent(&mut w)?;
            let text = self.inst_text(inst);
            writeln!(w, "{text};")?;
        }
        self.level -= 1;

        Ok(())
    }

    /// Returns the textual form of `inst` without the trailing `;`.
    pub fn inst_text(&self, inst: InstId) -> String {
        let mut text = String::new();
        if let Some(result) = self.func.dfg.inst_result(inst) {
            text.push_str(&self.value_with_ty(result));
            text.push_str(" = ");
        }

        let data = self.func.dfg.inst(inst);
        text.push_str(data.name());

        for operand in self.operands(data) {
            text.push(' ');
            text.push_str(&operand);
        }
        text
    }

    fn operands(&self, data: &InstData) -> Vec<String> {
        let v = |value: &ValueId| self.value(*value);
        match data {
            InstData::Binary { args, .. } | InstData::Cmp { args, .. } => {
                args.iter().map(v).collect()
            }
            InstData::Cast { arg, .. } => vec![v(arg)],
            InstData::Select {
                cond,
                then_val,
                else_val,
            } => vec![v(cond), v(then_val), v(else_val)],
            InstData::ExtractElement { vec, idx } => vec![v(vec), idx.to_string()],
            InstData::InsertElement { vec, elem, idx } => {
                vec![v(vec), v(elem), idx.to_string()]
            }
            InstData::Alloca { ty, addr_space } => vec![
                self.module.types.display(*ty),
                addr_space_name(*addr_space).to_string(),
            ],
            InstData::Load { addr, align, .. } => vec![v(addr), align.to_string()],
            InstData::Store { addr, value, align } => {
                vec![v(addr), v(value), align.to_string()]
            }
            InstData::Gep {
                base,
                elem_ty,
                indices,
            } => {
                let mut ops = vec![v(base), self.module.types.display(*elem_ty)];
                ops.extend(indices.iter().map(v));
                ops
            }
            InstData::Call { callee, args, .. } => {
                let mut ops = vec![format!("%{}", self.module.func_name(*callee))];
                ops.extend(args.iter().map(v));
                ops
            }
            InstData::Phi { args, .. } => args
                .iter()
                .map(|(value, block)| format!("({} {block})", v(value)))
                .collect(),
            InstData::Jump { dest } => vec![dest.to_string()],
            InstData::Br {
                cond,
                then_dest,
                else_dest,
            } => vec![v(cond), then_dest.to_string(), else_dest.to_string()],
            InstData::Switch {
                scrutinee,
                default,
                table,
            } => {
                let mut ops = vec![v(scrutinee), default.to_string()];
                ops.extend(table.iter().map(|(key, dest)| format!("({key} {dest})")));
                ops
            }
            InstData::Return { arg } => arg.iter().map(v).collect(),
            InstData::Unreachable => vec![],
            InstData::Rt(rt) => self.rt_operands(rt),
        }
    }

    fn rt_operands(&self, rt: &RtInst) -> Vec<String> {
        let v = |value: &ValueId| self.value(*value);
        match rt {
            RtInst::AllocaNumber { number } => vec![number.to_string()],
            RtInst::Spill { value, offset } => vec![v(value), offset.to_string()],
            RtInst::Fill { offset, .. } => vec![offset.to_string()],
            RtInst::TraceRay(data) => {
                let mut ops = vec![
                    v(&data.accel),
                    v(&data.ray_flags),
                    v(&data.instance_mask),
                    v(&data.ray_contribution),
                    v(&data.geometry_multiplier),
                    v(&data.miss_index),
                ];
                ops.extend(data.ray_info.iter().map(v));
                ops.push(v(&data.payload));
                ops.push(format!(
                    "%{}#{}",
                    self.module.func_name(data.cont.func),
                    data.cont.id
                ));
                if let Some(size) = data.spill_size {
                    ops.push(format!("spill_size={size}"));
                }
                ops
            }
            RtInst::CallShader(data) => {
                let mut ops = vec![
                    v(&data.shader_index),
                    v(&data.payload),
                    format!(
                        "%{}#{}",
                        self.module.func_name(data.cont.func),
                        data.cont.id
                    ),
                ];
                if let Some(size) = data.spill_size {
                    ops.push(format!("spill_size={size}"));
                }
                ops
            }
            RtInst::PayloadPtr {
                payload,
                frame_addr,
            } => vec![v(payload), v(frame_addr)],
            RtInst::Signpost { frame_addr, offset } => {
                let mut ops = vec![v(frame_addr)];
                if let Some(offset) = offset {
                    ops.push(offset.to_string());
                }
                ops
            }
            RtInst::DispatchRayIndex { dim }
            | RtInst::DispatchDimensions { dim }
            | RtInst::GroupId { dim } => vec![dim.to_string()],
            RtInst::HitAttribute { index, .. } => vec![index.to_string()],
            RtInst::ShaderRecordPtr { func } => {
                vec![format!("%{}", self.module.func_name(*func))]
            }
            RtInst::TraceRayAsync { ctrl } => vec![ctrl.to_string()],
            RtInst::BtdCall { addr } => vec![v(addr)],
            RtInst::Payload
            | RtInst::FrameAddr
            | RtInst::HitKind
            | RtInst::LocalBufferPtr
            | RtInst::AsyncStackPtr
            | RtInst::HotZonePtr
            | RtInst::DispatchGlobalsPtr
            | RtInst::SwStackBase
            | RtInst::LaneId
            | RtInst::SpillAnchor
            | RtInst::StackIdRelease => vec![],
        }
    }

    /// Immediates and undefs print with their type, other values print as
    /// `v{N}`.
    pub fn value(&self, value: ValueId) -> String {
        let types = &self.module.types;
        match self.func.dfg.value(value) {
            Value::Immediate { imm, ty } => format!("{imm}.{}", types.display(*ty)),
            Value::Undef { ty } => format!("undef.{}", types.display(*ty)),
            Value::Inst { .. } | Value::Arg { .. } => format!("v{}", value.0),
        }
    }

    fn value_with_ty(&self, value: ValueId) -> String {
        let ty = self.func.dfg.value_ty(value);
        format!("v{}.{}", value.0, self.module.types.display(ty))
    }

    fn indent(&self, mut w: impl io::Write) -> io::Result<()> {
        w.write_all(" ".repeat(self.level as usize * 4).as_bytes())
    }

    fn newline(&self, mut w: impl io::Write) -> io::Result<()> {
        w.write_all(b"\n")
    }
}

fn addr_space_name(space: AddrSpace) -> &'static str {
    match space {
        AddrSpace::Private => "private",
        AddrSpace::Global => "global",
        AddrSpace::Constant => "constant",
    }
}

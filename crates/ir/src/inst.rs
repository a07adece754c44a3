//! Instruction definitions.
//!
//! Every instruction is one variant of the closed [`InstData`] enum. Ray
//! tracing specific operations, both the placeholders produced by the shader
//! splitter and the hardware primitives emitted by lowering, live in
//! [`RtInst`].
use std::fmt;

use cranelift_entity::entity_impl;
use smallvec::SmallVec;

use crate::{module::FuncRef, AddrSpace, BlockId, Type, ValueId};

/// An opaque reference to [`InstData`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);
entity_impl!(InstId, "inst");

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstData {
    Binary {
        code: BinaryOp,
        args: [ValueId; 2],
    },
    Cmp {
        code: CmpOp,
        args: [ValueId; 2],
    },
    Cast {
        code: CastOp,
        arg: ValueId,
        ty: Type,
    },
    Select {
        cond: ValueId,
        then_val: ValueId,
        else_val: ValueId,
    },
    ExtractElement {
        vec: ValueId,
        idx: u32,
    },
    InsertElement {
        vec: ValueId,
        elem: ValueId,
        idx: u32,
    },
    Alloca {
        ty: Type,
        addr_space: AddrSpace,
    },
    Load {
        addr: ValueId,
        ty: Type,
        align: u32,
    },
    Store {
        addr: ValueId,
        value: ValueId,
        align: u32,
    },
    /// Typed address computation. The first index scales by the size of
    /// `elem_ty`, the rest step into aggregates.
    Gep {
        base: ValueId,
        elem_ty: Type,
        indices: SmallVec<[ValueId; 4]>,
    },
    Call {
        callee: FuncRef,
        args: SmallVec<[ValueId; 4]>,
        ret_ty: Type,
    },
    Phi {
        args: SmallVec<[(ValueId, BlockId); 4]>,
        ty: Type,
    },
    Jump {
        dest: BlockId,
    },
    Br {
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Switch {
        scrutinee: ValueId,
        default: BlockId,
        table: SmallVec<[(u64, BlockId); 4]>,
    },
    Return {
        arg: Option<ValueId>,
    },
    Unreachable,
    Rt(RtInst),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Lshr,
    FAdd,
    FMul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Ult,
    Ule,
    Slt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Zext,
    Sext,
    Trunc,
    Bitcast,
    PtrToInt,
    IntToPtr,
}

/// A continuation referenced from a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContRef {
    /// 32-bit continuation ID, unique within a module.
    pub id: u32,
    pub func: FuncRef,
}

/// Number of ray-info floats (origin, direction, tmin, tmax).
pub const RAY_INFO_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceRayData {
    pub accel: ValueId,
    pub ray_flags: ValueId,
    pub instance_mask: ValueId,
    pub ray_contribution: ValueId,
    pub geometry_multiplier: ValueId,
    pub miss_index: ValueId,
    /// origin.xyz, tmin, direction.xyz, tmax.
    pub ray_info: [ValueId; RAY_INFO_LEN],
    pub payload: ValueId,
    pub cont: ContRef,
    /// Bytes of live spills preceding this suspension point.
    pub spill_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallShaderData {
    pub shader_index: ValueId,
    pub payload: ValueId,
    pub cont: ContRef,
    pub spill_size: Option<u64>,
}

/// Control bits of the asynchronous trace message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCtrl {
    Initial,
    /// Commit the current hit and continue with the closest-hit shader.
    Commit,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RtInst {
    /// The address of the `number`th non-private alloca of the root function.
    AllocaNumber { number: u32 },
    Spill { value: ValueId, offset: u64 },
    Fill { offset: u64, ty: Type },
    TraceRay(TraceRayData),
    CallShader(CallShaderData),
    /// The incoming payload pointer of a shader.
    Payload,
    /// Marks the lowered payload pointer of a root so later passes can
    /// recognize payload accesses.
    PayloadPtr { payload: ValueId, frame_addr: ValueId },
    /// Marks the frame base of a continuation. `offset` is the byte offset of
    /// the payload in that frame once it is known.
    Signpost {
        frame_addr: ValueId,
        offset: Option<u64>,
    },
    /// The base address of the current stack frame.
    FrameAddr,
    DispatchRayIndex { dim: u8 },
    DispatchDimensions { dim: u8 },
    HitKind,
    /// A 32-bit word of the custom attributes of a procedural hit.
    HitAttribute { index: u32, ty: Type },
    /// Pointer to the local root signature of the current shader record.
    LocalBufferPtr,

    /// Per-lane asynchronous-operation record shared with the ray-tracing unit.
    AsyncStackPtr,
    /// Per-lane software hot zone holding the stack offset and dispatch index.
    HotZonePtr,
    DispatchGlobalsPtr,
    /// Base of the software stack of the current lane.
    SwStackBase,
    GroupId { dim: u8 },
    LaneId,
    /// Address of the shader record of a continuation.
    ShaderRecordPtr { func: FuncRef },
    /// Filler dword written to keep the spill area byte stable.
    SpillAnchor,
    TraceRayAsync { ctrl: TraceCtrl },
    /// Bindless thread dispatch to the shader at `addr`.
    BtdCall { addr: ValueId },
    StackIdRelease,
}

impl InstData {
    pub fn visit_values(&self, f: &mut dyn FnMut(ValueId)) {
        match self {
            Self::Binary { args, .. } | Self::Cmp { args, .. } => args.iter().for_each(|v| f(*v)),
            Self::Cast { arg, .. } => f(*arg),
            Self::Select {
                cond,
                then_val,
                else_val,
            } => {
                f(*cond);
                f(*then_val);
                f(*else_val);
            }
            Self::ExtractElement { vec, .. } => f(*vec),
            Self::InsertElement { vec, elem, .. } => {
                f(*vec);
                f(*elem);
            }
            Self::Load { addr, .. } => f(*addr),
            Self::Store { addr, value, .. } => {
                f(*addr);
                f(*value);
            }
            Self::Gep { base, indices, .. } => {
                f(*base);
                indices.iter().for_each(|v| f(*v));
            }
            Self::Call { args, .. } => args.iter().for_each(|v| f(*v)),
            Self::Phi { args, .. } => args.iter().for_each(|(v, _)| f(*v)),
            Self::Br { cond, .. } => f(*cond),
            Self::Switch { scrutinee, .. } => f(*scrutinee),
            Self::Return { arg } => {
                if let Some(arg) = arg {
                    f(*arg)
                }
            }
            Self::Rt(rt) => rt.visit_values(f),
            Self::Alloca { .. } | Self::Jump { .. } | Self::Unreachable => {}
        }
    }

    pub fn visit_values_mut(&mut self, f: &mut dyn FnMut(&mut ValueId)) {
        match self {
            Self::Binary { args, .. } | Self::Cmp { args, .. } => args.iter_mut().for_each(f),
            Self::Cast { arg, .. } => f(arg),
            Self::Select {
                cond,
                then_val,
                else_val,
            } => {
                f(cond);
                f(then_val);
                f(else_val);
            }
            Self::ExtractElement { vec, .. } => f(vec),
            Self::InsertElement { vec, elem, .. } => {
                f(vec);
                f(elem);
            }
            Self::Load { addr, .. } => f(addr),
            Self::Store { addr, value, .. } => {
                f(addr);
                f(value);
            }
            Self::Gep { base, indices, .. } => {
                f(base);
                indices.iter_mut().for_each(f);
            }
            Self::Call { args, .. } => args.iter_mut().for_each(f),
            Self::Phi { args, .. } => args.iter_mut().for_each(|(v, _)| f(v)),
            Self::Br { cond, .. } => f(cond),
            Self::Switch { scrutinee, .. } => f(scrutinee),
            Self::Return { arg } => {
                if let Some(arg) = arg {
                    f(arg)
                }
            }
            Self::Rt(rt) => rt.visit_values_mut(f),
            Self::Alloca { .. } | Self::Jump { .. } | Self::Unreachable => {}
        }
    }

    pub fn collect_values(&self) -> SmallVec<[ValueId; 8]> {
        let mut values = SmallVec::new();
        self.visit_values(&mut |v| values.push(v));
        values
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::Br { .. }
                | Self::Switch { .. }
                | Self::Return { .. }
                | Self::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// Returns destinations if the instruction is a branch.
    pub fn branch_dests(&self) -> Option<SmallVec<[BlockId; 4]>> {
        match self {
            Self::Jump { dest } => Some(smallvec::smallvec![*dest]),
            Self::Br {
                then_dest,
                else_dest,
                ..
            } => Some(smallvec::smallvec![*then_dest, *else_dest]),
            Self::Switch { default, table, .. } => {
                let mut dests: SmallVec<[BlockId; 4]> = smallvec::smallvec![*default];
                dests.extend(table.iter().map(|(_, dest)| *dest));
                Some(dests)
            }
            _ => None,
        }
    }

    /// Rewrites every branch destination `from` to `to`.
    pub fn rewrite_dest(&mut self, from: BlockId, to: BlockId) {
        let rewrite = |dest: &mut BlockId| {
            if *dest == from {
                *dest = to;
            }
        };
        match self {
            Self::Jump { dest } => rewrite(dest),
            Self::Br {
                then_dest,
                else_dest,
                ..
            } => {
                rewrite(then_dest);
                rewrite(else_dest);
            }
            Self::Switch { default, table, .. } => {
                rewrite(default);
                table.iter_mut().for_each(|(_, dest)| rewrite(dest));
            }
            _ => {}
        }
    }

    pub fn has_side_effect(&self) -> bool {
        match self {
            Self::Store { .. } | Self::Call { .. } => true,
            Self::Rt(rt) => rt.has_side_effect(),
            inst => inst.is_terminator(),
        }
    }

    pub fn rt(&self) -> Option<&RtInst> {
        match self {
            Self::Rt(rt) => Some(rt),
            _ => None,
        }
    }

    pub fn rt_mut(&mut self) -> Option<&mut RtInst> {
        match self {
            Self::Rt(rt) => Some(rt),
            _ => None,
        }
    }

    /// Returns the invoked continuation if the instruction is a suspension
    /// point.
    pub fn suspend_target(&self) -> Option<ContRef> {
        match self.rt()? {
            RtInst::TraceRay(data) => Some(data.cont),
            RtInst::CallShader(data) => Some(data.cont),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Binary { code, .. } => code.name(),
            Self::Cmp { code, .. } => code.name(),
            Self::Cast { code, .. } => code.name(),
            Self::Select { .. } => "select",
            Self::ExtractElement { .. } => "extract_element",
            Self::InsertElement { .. } => "insert_element",
            Self::Alloca { .. } => "alloca",
            Self::Load { .. } => "load",
            Self::Store { .. } => "store",
            Self::Gep { .. } => "gep",
            Self::Call { .. } => "call",
            Self::Phi { .. } => "phi",
            Self::Jump { .. } => "jump",
            Self::Br { .. } => "br",
            Self::Switch { .. } => "switch",
            Self::Return { .. } => "return",
            Self::Unreachable => "unreachable",
            Self::Rt(rt) => rt.name(),
        }
    }
}

impl RtInst {
    fn visit_values(&self, f: &mut dyn FnMut(ValueId)) {
        match self {
            Self::Spill { value, .. } => f(*value),
            Self::TraceRay(data) => {
                f(data.accel);
                f(data.ray_flags);
                f(data.instance_mask);
                f(data.ray_contribution);
                f(data.geometry_multiplier);
                f(data.miss_index);
                data.ray_info.iter().for_each(|v| f(*v));
                f(data.payload);
            }
            Self::CallShader(data) => {
                f(data.shader_index);
                f(data.payload);
            }
            Self::PayloadPtr {
                payload,
                frame_addr,
            } => {
                f(*payload);
                f(*frame_addr);
            }
            Self::Signpost { frame_addr, .. } => f(*frame_addr),
            Self::BtdCall { addr } => f(*addr),
            _ => {}
        }
    }

    fn visit_values_mut(&mut self, f: &mut dyn FnMut(&mut ValueId)) {
        match self {
            Self::Spill { value, .. } => f(value),
            Self::TraceRay(data) => {
                f(&mut data.accel);
                f(&mut data.ray_flags);
                f(&mut data.instance_mask);
                f(&mut data.ray_contribution);
                f(&mut data.geometry_multiplier);
                f(&mut data.miss_index);
                data.ray_info.iter_mut().for_each(|v| f(v));
                f(&mut data.payload);
            }
            Self::CallShader(data) => {
                f(&mut data.shader_index);
                f(&mut data.payload);
            }
            Self::PayloadPtr {
                payload,
                frame_addr,
            } => {
                f(payload);
                f(frame_addr);
            }
            Self::Signpost { frame_addr, .. } => f(frame_addr),
            Self::BtdCall { addr } => f(addr),
            _ => {}
        }
    }

    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Self::Spill { .. }
                | Self::TraceRay(_)
                | Self::CallShader(_)
                | Self::Signpost { .. }
                | Self::TraceRayAsync { .. }
                | Self::BtdCall { .. }
                | Self::StackIdRelease
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AllocaNumber { .. } => "rt.alloca_number",
            Self::Spill { .. } => "rt.spill",
            Self::Fill { .. } => "rt.fill",
            Self::TraceRay(_) => "rt.trace_ray",
            Self::CallShader(_) => "rt.call_shader",
            Self::Payload => "rt.payload",
            Self::PayloadPtr { .. } => "rt.payload_ptr",
            Self::Signpost { .. } => "rt.signpost",
            Self::FrameAddr => "rt.frame_addr",
            Self::DispatchRayIndex { .. } => "rt.dispatch_ray_index",
            Self::DispatchDimensions { .. } => "rt.dispatch_dimensions",
            Self::HitKind => "rt.hit_kind",
            Self::HitAttribute { .. } => "rt.hit_attribute",
            Self::LocalBufferPtr => "rt.local_buffer_ptr",
            Self::AsyncStackPtr => "rt.async_stack_ptr",
            Self::HotZonePtr => "rt.hot_zone_ptr",
            Self::DispatchGlobalsPtr => "rt.dispatch_globals_ptr",
            Self::SwStackBase => "rt.sw_stack_base",
            Self::GroupId { .. } => "rt.group_id",
            Self::LaneId => "rt.lane_id",
            Self::ShaderRecordPtr { .. } => "rt.shader_record_ptr",
            Self::SpillAnchor => "rt.spill_anchor",
            Self::TraceRayAsync { .. } => "rt.trace_ray_async",
            Self::BtdCall { .. } => "rt.btd_call",
            Self::StackIdRelease => "rt.stack_id_release",
        }
    }
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Lshr => "lshr",
            Self::FAdd => "fadd",
            Self::FMul => "fmul",
        }
    }
}

impl CmpOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Ult => "ult",
            Self::Ule => "ule",
            Self::Slt => "slt",
        }
    }
}

impl CastOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Zext => "zext",
            Self::Sext => "sext",
            Self::Trunc => "trunc",
            Self::Bitcast => "bitcast",
            Self::PtrToInt => "ptr_to_int",
            Self::IntToPtr => "int_to_ptr",
        }
    }
}

impl fmt::Display for TraceCtrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Commit => write!(f, "commit"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

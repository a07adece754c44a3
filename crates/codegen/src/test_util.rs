//! Module fixtures shared by the unit tests.
pub use raystack_ir::{
    builder::test_util::*, inst::ContRef, AddrSpace, FuncRef, Module, ShaderKind, Type,
};

pub use crate::rt_builder::{CONST_PTR, GLOBAL_PTR};

use raystack_ir::{
    builder::{FunctionBuilder, ModuleBuilder},
    func_cursor::InstInserter,
    inst::{TraceRayData, RAY_INFO_LEN},
    InstId, ShaderInfo, Signature, ValueId,
};

use crate::{config::LoweringConfig, context::RtContext};

pub fn test_ctx() -> RtContext {
    test_ctx_with(LoweringConfig::default())
}

pub fn test_ctx_with(config: LoweringConfig) -> RtContext {
    RtContext::new(build_test_triple(), config)
}

pub fn declare_shader(mb: &mut ModuleBuilder, name: &str, kind: ShaderKind) -> FuncRef {
    mb.declare_shader(Signature::new(name, &[], Type::Unit), ShaderInfo::root(kind))
}

pub fn declare_raygen(mb: &mut ModuleBuilder, name: &str) -> FuncRef {
    declare_shader(mb, name, ShaderKind::RayGen)
}

pub fn declare_continuation(
    mb: &mut ModuleBuilder,
    name: &str,
    kind: ShaderKind,
    parent: FuncRef,
) -> FuncRef {
    mb.declare_shader(
        Signature::new(name, &[], Type::Unit),
        ShaderInfo::continuation(kind, parent),
    )
}

/// Traces a ray with zeroed parameters and suspends into `cont`.
pub fn trace_ray(
    builder: &mut FunctionBuilder<'_, InstInserter>,
    payload: ValueId,
    cont: ContRef,
) -> InstId {
    let zero = builder.make_imm_value(0.0f32);
    trace_ray_with_info(builder, payload, cont, [zero; RAY_INFO_LEN])
}

pub fn trace_ray_with_info(
    builder: &mut FunctionBuilder<'_, InstInserter>,
    payload: ValueId,
    cont: ContRef,
    ray_info: [ValueId; RAY_INFO_LEN],
) -> InstId {
    let accel = builder.make_imm_value(0i64);
    let zero = builder.make_imm_value(0i32);
    let mask = builder.make_imm_value(0xFFi32);
    builder.trace_ray(TraceRayData {
        accel,
        ray_flags: zero,
        instance_mask: mask,
        ray_contribution: zero,
        geometry_multiplier: zero,
        miss_index: zero,
        ray_info,
        payload,
        cont,
        spill_size: None,
    })
}

pub struct SimpleSpill {
    pub root: FuncRef,
    pub cont: FuncRef,
    pub spill: InstId,
    pub fill: InstId,
    /// The value spilled by `root`.
    pub spilled: ValueId,
}

/// `main` spills an `f32` at offset 0 and traces into `main.cont` (ID 1),
/// which fills it back in its entry.
pub fn simple_spill_module() -> (Module, SimpleSpill) {
    let mut mb = test_module_builder();
    let root = declare_raygen(&mut mb, "main");
    let cont = declare_continuation(&mut mb, "main.cont", ShaderKind::RayGen, root);

    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let one = builder.make_imm_value(1.0f32);
    let spilled = builder.fadd(one, one);
    let spill = builder.spill(spilled, 0);
    let payload = builder.make_undef_value(GLOBAL_PTR);
    trace_ray(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);

    let mut builder = mb.func_builder(cont);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let filled = builder.fill(0, Type::F32);
    let fill = builder.last_inst().unwrap();
    builder.fadd(filled, filled);
    builder.ret(None);

    (
        mb.build(),
        SimpleSpill {
            root,
            cont,
            spill,
            fill,
            spilled,
        },
    )
}

use raystack_codegen::{
    lowering::MERGE_FUNC_NAME, FrameLayoutReport, LoweringConfig, RayTracingPipeline, RtContext,
};
use raystack_ir::{
    builder::{test_util::*, FunctionBuilder, ModuleBuilder},
    func_cursor::InstInserter,
    inst::{ContRef, TraceCtrl, TraceRayData, RAY_INFO_LEN},
    AddrSpace, FuncRef, InstData, Module, RtInst, ShaderInfo, ShaderKind, Signature, Type,
    ValueId,
};

const GLOBAL_PTR: Type = Type::Ptr(AddrSpace::Global);

fn ctx(config: LoweringConfig) -> RtContext {
    RtContext::new(build_test_triple(), config)
}

fn shader(mb: &mut ModuleBuilder, name: &str, info: ShaderInfo) -> FuncRef {
    mb.declare_shader(Signature::new(name, &[], Type::Unit), info)
}

fn trace(builder: &mut FunctionBuilder<'_, InstInserter>, payload: ValueId, cont: ContRef) {
    let zero = builder.make_imm_value(0i32);
    let accel = builder.make_imm_value(0i64);
    let ray = builder.make_imm_value(0.0f32);
    builder.trace_ray(TraceRayData {
        accel,
        ray_flags: zero,
        instance_mask: zero,
        ray_contribution: zero,
        geometry_multiplier: zero,
        miss_index: zero,
        ray_info: [ray; RAY_INFO_LEN],
        payload,
        cont,
        spill_size: None,
    });
}

/// `main` keeps an `f32` alive across a trace into `main.cont` and traces
/// with a payload alloca. `hit` writes the payload and returns.
fn raygen_with_hit() -> (Module, FuncRef, FuncRef, FuncRef) {
    let mut mb = test_module_builder();
    let main = shader(&mut mb, "main", ShaderInfo::root(ShaderKind::RayGen));
    let cont = shader(
        &mut mb,
        "main.cont",
        ShaderInfo::continuation(ShaderKind::RayGen, main),
    );
    let hit = shader(&mut mb, "hit", ShaderInfo::root(ShaderKind::ClosestHit));

    let mut builder = mb.func_builder(main);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.alloca(Type::F32, AddrSpace::Global);
    let one = builder.make_imm_value(1.0f32);
    let live = builder.fadd(one, one);
    builder.spill(live, 0);
    trace(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);

    let mut builder = mb.func_builder(cont);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let filled = builder.fill(0, Type::F32);
    builder.fadd(filled, filled);
    builder.ret(None);

    let mut builder = mb.func_builder(hit);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.payload();
    let two = builder.make_imm_value(2.0f32);
    builder.store(payload, two, 4);
    builder.ret(None);

    (mb.build(), main, cont, hit)
}

fn rt_insts(module: &Module, func: FuncRef) -> Vec<RtInst> {
    let func = &module.funcs[func];
    func.rt_insts().map(|(_, rt)| rt.clone()).collect()
}

fn is_lowered(rt: &RtInst) -> bool {
    matches!(
        rt,
        RtInst::AsyncStackPtr
            | RtInst::HotZonePtr
            | RtInst::DispatchGlobalsPtr
            | RtInst::SwStackBase
            | RtInst::GroupId { .. }
            | RtInst::LaneId
            | RtInst::ShaderRecordPtr { .. }
            | RtInst::SpillAnchor
            | RtInst::TraceRayAsync { .. }
            | RtInst::BtdCall { .. }
            | RtInst::StackIdRelease
            | RtInst::LocalBufferPtr
    )
}

#[test]
fn every_placeholder_is_lowered() {
    let (mut module, main, cont, hit) = raygen_with_hit();
    let mut pipeline = RayTracingPipeline::default_pipeline(ctx(LoweringConfig::default()));
    let stats = pipeline.run(&mut module).unwrap();

    for func in [main, cont, hit] {
        let leftovers: Vec<_> = rt_insts(&module, func)
            .into_iter()
            .filter(|rt| !is_lowered(rt))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    // The closest-hit shader resumes its caller through the merge helper.
    let merge = stats.merge_func.unwrap();
    assert_eq!(module.func_name(merge), MERGE_FUNC_NAME);
    assert!(rt_insts(&module, merge)
        .iter()
        .any(|rt| matches!(rt, RtInst::BtdCall { .. })));

    let main_info = module.shader_info(main).unwrap();
    assert_eq!(main_info.stack_size % 16, 0);
    assert!(main_info.stack_size >= 8);
    assert!(rt_insts(&module, main).contains(&RtInst::TraceRayAsync {
        ctrl: TraceCtrl::Initial
    }));
}

#[test]
fn whole_program_resumes_the_unique_continuation_directly() {
    let (mut module, _, cont, hit) = raygen_with_hit();
    let config = LoweringConfig {
        whole_program: true,
        indirect_continuations: false,
        ..LoweringConfig::default()
    };
    let stats = RayTracingPipeline::default_pipeline(ctx(config))
        .run(&mut module)
        .unwrap();

    let merge = stats.merge_func.unwrap();
    let func = &module.funcs[hit];
    let merge_args: Vec<_> = func
        .iter_insts()
        .filter_map(|inst| match func.dfg.inst(inst) {
            InstData::Call { callee, args, .. } if *callee == merge => Some(args[0]),
            _ => None,
        })
        .collect();
    assert_eq!(merge_args.len(), 1);
    assert_eq!(
        func.dfg.value_imm(merge_args[0]).and_then(|imm| imm.as_i64()),
        Some(1)
    );

    // The merge helper switches straight into the continuation.
    let merge_func = &module.funcs[merge];
    let calls_cont = merge_func.iter_insts().any(|inst| {
        matches!(merge_func.dfg.inst(inst), InstData::Call { callee, .. } if *callee == cont)
    });
    assert!(calls_cont);
}

#[test]
fn hit_group_drops_overwritten_any_hit_stores() {
    let mut mb = test_module_builder();
    let any_hit = shader(&mut mb, "ah", ShaderInfo::root(ShaderKind::AnyHit));
    let closest_hit = shader(&mut mb, "ch", ShaderInfo::root(ShaderKind::ClosestHit));

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
    let two = builder.make_imm_value(2i32);
    builder.store(payload, two, 4);
    builder.ret(None);
    let mut module = mb.build();

    let mut pipeline = RayTracingPipeline::default_pipeline(ctx(LoweringConfig::default()));
    pipeline.add_hit_group(any_hit, closest_hit);
    let stats = pipeline.run(&mut module).unwrap();
    assert_eq!(stats.dead_payload_stores, 1);

    let func = &module.funcs[any_hit];
    let stores = func
        .iter_insts()
        .filter(|inst| {
            matches!(func.dfg.inst(*inst), InstData::Store { value, .. } if *value == one)
        })
        .count();
    assert_eq!(stores, 0);
}

#[test]
fn layout_report_lists_the_spill_region() {
    let (mut module, main, _, _) = raygen_with_hit();
    let config = LoweringConfig {
        emit_layout_entries: true,
        ..LoweringConfig::default()
    };
    RayTracingPipeline::default_pipeline(ctx(config))
        .run(&mut module)
        .unwrap();

    let report = FrameLayoutReport::new(&module, main).unwrap().to_string();
    assert!(report.starts_with("shader: \"main\"\nkind: raygeneration\n"));
    assert!(report.contains("  - kind: alloca\n"));
    assert!(report.contains("  - kind: spill_union\n"));
}

#[test]
fn functions_without_metadata_are_left_alone() {
    let mut mb = test_module_builder();
    let main = shader(&mut mb, "main", ShaderInfo::root(ShaderKind::RayGen));
    let cont = mb.declare_function(Signature::new("main.cont", &[], Type::Unit));
    let mut builder = mb.func_builder(main);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.make_undef_value(GLOBAL_PTR);
    trace(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);
    let mut module = mb.build();
    module.shaders.remove(&main);

    let stats = RayTracingPipeline::default_pipeline(ctx(LoweringConfig::default()))
        .run(&mut module)
        .unwrap();
    assert_eq!(stats.merge_func, None);
    assert!(rt_insts(&module, main)
        .iter()
        .any(|rt| matches!(rt, RtInst::TraceRay(_))));
}

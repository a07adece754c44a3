use raystack_ir::{
    builder::ModuleBuilder,
    inst::{BinaryOp, CastOp, TraceCtrl},
    shader::HitGroupKind,
    InstData, InstId, RtInst, ShaderInfo, Signature, ValueId,
};

use super::*;
use crate::{config::LoweringConfig, late_remat::LateRemat, test_util::*};

fn insts(module: &Module, func: FuncRef) -> Vec<InstId> {
    let func = &module.funcs[func];
    func.iter_insts().collect()
}

fn rt_insts(module: &Module, func: FuncRef) -> Vec<RtInst> {
    insts(module, func)
        .into_iter()
        .filter_map(|inst| module.funcs[func].dfg.rt(inst).cloned())
        .collect()
}

fn is_placeholder(rt: &RtInst) -> bool {
    matches!(
        rt,
        RtInst::AllocaNumber { .. }
            | RtInst::Spill { .. }
            | RtInst::Fill { .. }
            | RtInst::TraceRay(_)
            | RtInst::CallShader(_)
            | RtInst::Payload
            | RtInst::FrameAddr
            | RtInst::DispatchRayIndex { .. }
            | RtInst::DispatchDimensions { .. }
            | RtInst::HitKind
            | RtInst::HitAttribute { .. }
    )
}

/// Walks constant byte and field offsets back from `addr`.
fn const_offset(module: &Module, func: FuncRef, mut addr: ValueId) -> (ValueId, i64) {
    let dfg = &module.funcs[func].dfg;
    let mut offset = 0;
    while let Some(inst) = dfg.value_inst(addr) {
        let InstData::Gep {
            base,
            elem_ty,
            indices,
        } = dfg.inst(inst)
        else {
            break;
        };
        let Some(indices) = indices
            .iter()
            .map(|idx| dfg.value_imm(*idx)?.as_i64())
            .collect::<Option<Vec<_>>>()
        else {
            break;
        };
        offset += module.types.gep_offset(*elem_ty, &indices).unwrap().0;
        addr = *base;
    }
    (addr, offset)
}

fn stores_of(module: &Module, func: FuncRef, value: ValueId) -> Vec<ValueId> {
    insts(module, func)
        .into_iter()
        .filter_map(|inst| match module.funcs[func].dfg.inst(inst) {
            InstData::Store { addr, value: v, .. } if *v == value => Some(*addr),
            _ => None,
        })
        .collect()
}

fn rt_of(module: &Module, func: FuncRef, value: ValueId) -> Option<RtInst> {
    let dfg = &module.funcs[func].dfg;
    dfg.rt(dfg.value_inst(value)?).cloned()
}

fn lower(module: &mut Module, ctx: &RtContext) -> Option<FuncRef> {
    let mut lowering = IntrinsicLowering::new(ctx);
    lowering.run(module).unwrap();
    lowering.merge_func()
}

fn empty_body(mb: &mut ModuleBuilder, func: FuncRef) {
    let mut builder = mb.func_builder(func);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    builder.ret(None);
}

/// `main` passes an alloca at frame offset 8 as payload to `main.cont`.
fn alloca_payload_module() -> (ModuleBuilder, FuncRef, FuncRef) {
    let mut mb = test_module_builder();
    let root = declare_raygen(&mut mb, "main");
    let cont = declare_continuation(&mut mb, "main.cont", ShaderKind::RayGen, root);

    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let array = builder.types_mut().make_array(Type::I32, 4);
    builder.alloca(Type::I64, AddrSpace::Global);
    let payload = builder.alloca(array, AddrSpace::Global);
    trace_ray(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);

    empty_body(&mut mb, cont);
    (mb, root, cont)
}

#[test]
fn spill_and_fill_share_frame_slot() {
    let (mut module, fixture) = simple_spill_module();
    lower(&mut module, &test_ctx());

    assert_eq!(module.shader_info(fixture.root).unwrap().stack_size, 16);
    assert_eq!(module.shader_info(fixture.cont).unwrap().stack_size, 0);
    for func in [fixture.root, fixture.cont] {
        assert!(!rt_insts(&module, func).iter().any(is_placeholder));
    }

    let [spill_addr] = stores_of(&module, fixture.root, fixture.spilled)[..] else {
        panic!("one spill store expected");
    };
    let (base, offset) = const_offset(&module, fixture.root, spill_addr);
    assert_eq!(rt_of(&module, fixture.root, base), Some(RtInst::SwStackBase));
    assert_eq!(offset, 0);

    let cont = &module.funcs[fixture.cont];
    let fadd = insts(&module, fixture.cont)
        .into_iter()
        .find(|inst| matches!(cont.dfg.inst(*inst), InstData::Binary { code: BinaryOp::FAdd, .. }))
        .unwrap();
    let InstData::Binary { args, .. } = cont.dfg.inst(fadd) else {
        unreachable!();
    };
    let load = cont.dfg.value_inst(args[0]).unwrap();
    let InstData::Load { addr, ty, align } = cont.dfg.inst(load) else {
        panic!("fill must become a load");
    };
    assert_eq!((*ty, *align), (Type::F32, 16));
    assert_eq!(const_offset(&module, fixture.cont, *addr).1, 0);
}

/// `main` spills the address of the third element of an `[i32; 4]` alloca
/// at frame offset 8 and `main.cont` loads through the filled address.
/// Returns the spilled address and the load of `main.cont`.
fn alloca_address_module() -> (Module, FuncRef, FuncRef, ValueId, InstId) {
    let mut mb = test_module_builder();
    let root = declare_raygen(&mut mb, "main");
    let cont = declare_continuation(&mut mb, "main.cont", ShaderKind::RayGen, root);

    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let array = builder.types_mut().make_array(Type::I32, 4);
    builder.alloca(Type::I64, AddrSpace::Global);
    let addr = builder.alloca(array, AddrSpace::Global);
    let elem = builder.gep_const(addr, array, &[0, 2]);
    builder.spill(elem, 0);
    let payload = builder.make_undef_value(GLOBAL_PTR);
    trace_ray(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);

    let mut builder = mb.func_builder(cont);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let filled = builder.fill(0, GLOBAL_PTR);
    builder.load(filled, Type::I32, 4);
    let load = builder.last_inst().unwrap();
    builder.ret(None);

    (mb.build(), root, cont, elem, load)
}

/// Constant offset of `addr` from the frame base of the continuation `func`.
fn continuation_frame_offset(module: &Module, func: FuncRef, addr: ValueId) -> i64 {
    let (base, offset) = const_offset(module, func, addr);
    let dfg = &module.funcs[func].dfg;
    let InstData::Gep { base: stack, .. } = dfg.inst(dfg.value_inst(base).unwrap()) else {
        panic!("continuation frame base expected");
    };
    assert_eq!(rt_of(module, func, *stack), Some(RtInst::SwStackBase));
    offset
}

#[test]
fn rematerialized_address_matches_spilled_address() {
    let ctx = test_ctx();

    // Spilled: the continuation reads the pointer the root wrote.
    let (mut module, root, cont, elem, load) = alloca_address_module();
    lower(&mut module, &ctx);
    let [spill_addr] = stores_of(&module, root, elem)[..] else {
        panic!("one spill store expected");
    };
    let (spill_base, spill_offset) = const_offset(&module, root, spill_addr);
    let (elem_base, elem_offset) = const_offset(&module, root, elem);
    assert_eq!(rt_of(&module, root, spill_base), Some(RtInst::SwStackBase));
    assert_eq!(rt_of(&module, root, elem_base), Some(RtInst::SwStackBase));
    assert_eq!(spill_offset, 24);
    assert_eq!(elem_offset, 16);

    let cont_func = &module.funcs[cont];
    let InstData::Load { addr: filled, .. } = cont_func.dfg.inst(load) else {
        panic!("load expected");
    };
    let fill = cont_func.dfg.value_inst(*filled).unwrap();
    let InstData::Load { addr: fill_addr, ty, .. } = cont_func.dfg.inst(fill) else {
        panic!("fill must become a load");
    };
    assert_eq!(*ty, GLOBAL_PTR);
    assert_eq!(continuation_frame_offset(&module, cont, *fill_addr), spill_offset);

    // Rematerialized: the continuation recomputes the same frame address.
    let (mut module, _, cont, _, load) = alloca_address_module();
    assert!(LateRemat::new(&ctx).run(&mut module).unwrap());
    lower(&mut module, &ctx);
    let cont_func = &module.funcs[cont];
    let InstData::Load { addr, .. } = cont_func.dfg.inst(load) else {
        panic!("load expected");
    };
    assert_eq!(continuation_frame_offset(&module, cont, *addr), elem_offset);
}

#[test]
fn raygen_entry_is_guarded() {
    let (mut module, fixture) = simple_spill_module();
    lower(&mut module, &test_ctx());

    let func = &module.funcs[fixture.root];
    let blocks: Vec<_> = func.layout.iter_block().collect();
    assert_eq!(blocks.len(), 3);

    let entry_term = func.layout.last_inst_of(blocks[0]).unwrap();
    let InstData::Br {
        then_dest,
        else_dest,
        ..
    } = func.dfg.inst(entry_term)
    else {
        panic!("entry must branch on the dispatch bounds");
    };
    assert_eq!((*then_dest, *else_dest), (blocks[1], blocks[2]));

    let exit: Vec<_> = func.layout.iter_inst(blocks[2]).collect();
    assert_eq!(func.dfg.rt(exit[0]), Some(&RtInst::StackIdRelease));
    assert_eq!(func.dfg.inst(exit[1]), &InstData::Return { arg: None });

    let body: Vec<_> = func
        .layout
        .iter_inst(blocks[1])
        .filter_map(|inst| func.dfg.rt(inst).cloned())
        .collect();
    assert!(body.contains(&RtInst::TraceRayAsync {
        ctrl: TraceCtrl::Initial
    }));
}

#[test]
fn guard_can_be_disabled() {
    let (mut module, fixture) = simple_spill_module();
    let ctx = test_ctx_with(LoweringConfig {
        dispatch_bounds_check: false,
        ..Default::default()
    });
    lower(&mut module, &ctx);
    assert_eq!(module.funcs[fixture.root].layout.iter_block().count(), 1);
}

#[test]
fn guard_reuses_dispatch_dimensions() {
    let mut mb = test_module_builder();
    let root = declare_raygen(&mut mb, "main");
    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let width = builder.dispatch_dimensions(0);
    let height = builder.dispatch_dimensions(1);
    let area = builder.mul(width, height);
    let out = builder.make_undef_value(GLOBAL_PTR);
    builder.store(out, area, 4);
    builder.ret(None);
    let mut module = mb.build();

    lower(&mut module, &test_ctx());

    let func = &module.funcs[root];
    let mut offsets: Vec<_> = insts(&module, root)
        .into_iter()
        .filter_map(|inst| {
            let InstData::Load { addr, .. } = func.dfg.inst(inst) else {
                return None;
            };
            let (base, offset) = const_offset(&module, root, *addr);
            (rt_of(&module, root, base) == Some(RtInst::DispatchGlobalsPtr)).then_some(offset)
        })
        .collect();
    offsets.sort_unstable();
    assert_eq!(offsets, [0, 4]);
    assert_eq!(func.layout.iter_block().count(), 3);
}

#[test]
fn trace_writes_resume_address_into_next_frame() {
    let (mut module, fixture) = simple_spill_module();
    lower(&mut module, &test_ctx());

    let func = &module.funcs[fixture.root];
    let resume = insts(&module, fixture.root)
        .into_iter()
        .filter_map(|inst| match func.dfg.inst(inst) {
            InstData::Cast {
                code: CastOp::PtrToInt,
                arg,
                ..
            } => Some((func.dfg.inst_result(inst)?, *arg)),
            _ => None,
        })
        .find(|(_, arg)| {
            rt_of(&module, fixture.root, *arg) == Some(RtInst::ShaderRecordPtr { func: fixture.cont })
        })
        .map(|(result, _)| result)
        .unwrap();

    let [addr] = stores_of(&module, fixture.root, resume)[..] else {
        panic!("one resume address store expected");
    };
    let (base, offset) = const_offset(&module, fixture.root, addr);
    assert_eq!(rt_of(&module, fixture.root, base), Some(RtInst::SwStackBase));
    // The callee frame starts right after the 16-byte frame of `main`.
    assert_eq!(offset, 16);
}

#[test]
fn spill_region_is_padded_with_anchors() {
    let (mut module, fixture) = simple_spill_module();
    let trace = insts(&module, fixture.root)
        .into_iter()
        .find(|inst| module.funcs[fixture.root].dfg.inst(*inst).suspend_target().is_some())
        .unwrap();
    module.funcs[fixture.root].dfg.update_inst(trace, |data| {
        if let Some(RtInst::TraceRay(data)) = data.rt_mut() {
            data.spill_size = Some(4);
        }
    });
    lower(&mut module, &test_ctx());

    let func = &module.funcs[fixture.root];
    let anchor = insts(&module, fixture.root)
        .into_iter()
        .find(|inst| func.dfg.rt(*inst) == Some(&RtInst::SpillAnchor))
        .and_then(|inst| func.dfg.inst_result(inst))
        .unwrap();
    let offsets: Vec<_> = stores_of(&module, fixture.root, anchor)
        .into_iter()
        .map(|addr| const_offset(&module, fixture.root, addr).1)
        .collect();
    assert_eq!(offsets, [4, 8, 12]);
}

/// `main` traces into `main.cont`; `callee` is a callable root returning to
/// its caller.
fn returning_callable_module() -> (Module, FuncRef) {
    let mut mb = test_module_builder();
    let root = declare_raygen(&mut mb, "main");
    let cont = declare_continuation(&mut mb, "main.cont", ShaderKind::RayGen, root);
    let callee = declare_shader(&mut mb, "callee", ShaderKind::Callable);

    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.make_undef_value(GLOBAL_PTR);
    trace_ray(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);

    empty_body(&mut mb, cont);
    empty_body(&mut mb, callee);
    (mb.build(), callee)
}

fn merge_calls(module: &Module, func: FuncRef, merge: FuncRef) -> Vec<ValueId> {
    insts(module, func)
        .into_iter()
        .filter_map(|inst| match module.funcs[func].dfg.inst(inst) {
            InstData::Call { callee, args, .. } if *callee == merge => Some(args[0]),
            _ => None,
        })
        .collect()
}

#[test]
fn merge_helper_resumes_through_bindless_dispatch() {
    let (mut module, callee) = returning_callable_module();
    let merge = lower(&mut module, &test_ctx()).unwrap();
    assert_eq!(module.func_name(merge), MERGE_FUNC_NAME);

    let [return_addr] = merge_calls(&module, callee, merge)[..] else {
        panic!("one merge call expected");
    };
    let dfg = &module.funcs[callee].dfg;
    let InstData::Load { addr, ty, .. } = dfg.inst(dfg.value_inst(return_addr).unwrap()) else {
        panic!("return address must be loaded from the frame");
    };
    assert_eq!(*ty, Type::I64);
    assert_eq!(const_offset(&module, callee, *addr).1, frame_args::RETURN_IP);

    let body = &module.funcs[merge];
    let target = body.arg_values[0];
    let entry = body.layout.entry_block().unwrap();
    let insts: Vec<_> = body.layout.iter_inst(entry).map(|inst| body.dfg.inst(inst)).collect();
    assert_eq!(
        insts,
        [
            &InstData::Rt(RtInst::BtdCall { addr: target }),
            &InstData::Return { arg: None }
        ]
    );
}

#[test]
fn merge_helper_switches_over_continuation_ids() {
    let (mut module, _) = returning_callable_module();
    let ctx = test_ctx_with(LoweringConfig {
        indirect_continuations: false,
        ..Default::default()
    });
    let merge = lower(&mut module, &ctx).unwrap();
    let cont = module.func_by_name("main.cont").unwrap();

    let body = &module.funcs[merge];
    let entry = body.layout.entry_block().unwrap();
    let term = body.layout.last_inst_of(entry).unwrap();
    let InstData::Switch { default, table, .. } = body.dfg.inst(term) else {
        panic!("switch expected");
    };
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].0, 1);

    let case: Vec<_> = body.layout.iter_inst(table[0].1).map(|inst| body.dfg.inst(inst)).collect();
    assert!(matches!(case[0], InstData::Call { callee, .. } if *callee == cont));
    let default_term = body.layout.last_inst_of(*default).unwrap();
    assert_eq!(body.dfg.inst(default_term), &InstData::Unreachable);
}

#[test]
fn continuation_restores_stack_offset_before_returning() {
    let mut mb = test_module_builder();
    let root = declare_shader(&mut mb, "callee", ShaderKind::Callable);
    let cont = declare_continuation(&mut mb, "callee.cont", ShaderKind::Callable, root);

    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.make_undef_value(GLOBAL_PTR);
    trace_ray(&mut builder, payload, ContRef { id: 7, func: cont });
    builder.ret(None);
    empty_body(&mut mb, cont);
    let mut module = mb.build();

    let merge = lower(&mut module, &test_ctx()).unwrap();
    // The root suspends in its only block.
    assert!(merge_calls(&module, root, merge).is_empty());
    assert_eq!(merge_calls(&module, cont, merge).len(), 1);

    let func = &module.funcs[cont];
    let reset = insts(&module, cont)
        .into_iter()
        .find(|inst| matches!(func.dfg.inst(*inst), InstData::Binary { code: BinaryOp::Sub, .. }))
        .and_then(|inst| func.dfg.inst_result(inst))
        .unwrap();
    let [addr] = stores_of(&module, cont, reset)[..] else {
        panic!("one stack offset write back expected");
    };
    let (base, offset) = const_offset(&module, cont, addr);
    assert_eq!(rt_of(&module, cont, base), Some(RtInst::HotZonePtr));
    assert_eq!(offset, 0);
}

#[test]
fn signpost_records_payload_offset() {
    let (mb, _, cont) = alloca_payload_module();
    let mut module = mb.build();
    lower(&mut module, &test_ctx());

    let signposts: Vec<_> = rt_insts(&module, cont)
        .into_iter()
        .filter_map(|rt| match rt {
            RtInst::Signpost { offset, .. } => Some(offset),
            _ => None,
        })
        .collect();
    assert_eq!(signposts, [Some(8)]);

    strip_markers(&mut module);
    assert!(!rt_insts(&module, cont)
        .iter()
        .any(|rt| matches!(rt, RtInst::Signpost { .. })));
}

#[test]
fn unknown_payload_offset_drops_signposts() {
    let (mut module, fixture) = simple_spill_module();
    lower(&mut module, &test_ctx());
    assert!(!rt_insts(&module, fixture.cont)
        .iter()
        .any(|rt| matches!(rt, RtInst::Signpost { .. })));
}

#[test]
fn unique_continuation_rebases_payload() {
    let (mut mb, root, _) = alloca_payload_module();
    let hit = declare_shader(&mut mb, "hit", ShaderKind::ClosestHit);
    let mut builder = mb.func_builder(hit);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.payload();
    builder.load(payload, Type::I32, 4);
    builder.ret(None);
    let mut module = mb.build();

    let ctx = test_ctx_with(LoweringConfig {
        whole_program: true,
        indirect_continuations: false,
        ..Default::default()
    });
    let merge = lower(&mut module, &ctx).unwrap();
    // i64 at 0 and [i32; 4] at 8.
    assert_eq!(module.shader_info(root).unwrap().stack_size, 32);

    let func = &module.funcs[hit];
    let (payload, frame_addr) = rt_insts(&module, hit)
        .into_iter()
        .find_map(|rt| match rt {
            RtInst::PayloadPtr {
                payload,
                frame_addr,
            } => Some((payload, frame_addr)),
            _ => None,
        })
        .unwrap();
    let InstData::Gep { base, indices, .. } = func.dfg.inst(func.dfg.value_inst(payload).unwrap())
    else {
        panic!("payload must be rebased on the frame");
    };
    assert_eq!(*base, frame_addr);
    assert_eq!(func.dfg.value_imm(indices[0]).unwrap().as_i64(), Some(-24));

    // The resume target is the constant ID of the only continuation.
    let [return_addr] = merge_calls(&module, hit, merge)[..] else {
        panic!("one merge call expected");
    };
    assert_eq!(func.dfg.value_imm(return_addr).unwrap().as_i64(), Some(1));

    // Nothing is written into the callee frame anymore.
    let root_func = &module.funcs[root];
    let frame_stores = insts(&module, root)
        .into_iter()
        .filter(|inst| match root_func.dfg.inst(*inst) {
            InstData::Store { addr, .. } => {
                let (base, offset) = const_offset(&module, root, *addr);
                rt_of(&module, root, base) == Some(RtInst::SwStackBase) && offset >= 32
            }
            _ => false,
        })
        .count();
    assert_eq!(frame_stores, 0);
}

#[test]
fn triangle_hit_kind_reads_front_face_bit() {
    let mut mb = test_module_builder();
    let hit = declare_shader(&mut mb, "hit", ShaderKind::ClosestHit);
    let mut builder = mb.func_builder(hit);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let kind = builder.hit_kind();
    let ret_slot = builder.alloca(Type::I32, AddrSpace::Private);
    builder.store(ret_slot, kind, 4);
    builder.ret(None);
    let mut module = mb.build();
    lower(&mut module, &test_ctx());

    let func = &module.funcs[hit];
    let select = insts(&module, hit)
        .into_iter()
        .find(|inst| matches!(func.dfg.inst(*inst), InstData::Select { .. }))
        .unwrap();
    let InstData::Select {
        then_val, else_val, ..
    } = func.dfg.inst(select)
    else {
        unreachable!();
    };
    assert_eq!(func.dfg.value_imm(*then_val).unwrap().as_i64(), Some(0xFE));
    assert_eq!(func.dfg.value_imm(*else_val).unwrap().as_i64(), Some(0xFF));
}

#[test]
fn procedural_hit_reads_argument_region() {
    let mut mb = test_module_builder();
    let hit = mb.declare_shader(
        Signature::new("hit", &[], Type::Unit),
        ShaderInfo::root(ShaderKind::ClosestHit).with_hit_group(HitGroupKind::Procedural, 8),
    );
    let mut builder = mb.func_builder(hit);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let kind = builder.hit_kind();
    let attr = builder.hit_attribute(1, Type::F32);
    let slot = builder.alloca(Type::I32, AddrSpace::Private);
    builder.store(slot, kind, 4);
    builder.store(slot, attr, 4);
    builder.ret(None);
    let mut module = mb.build();
    lower(&mut module, &test_ctx());

    let func = &module.funcs[hit];
    let loads: Vec<_> = insts(&module, hit)
        .into_iter()
        .filter_map(|inst| match func.dfg.inst(inst) {
            InstData::Load { addr, ty, .. } if *ty != GLOBAL_PTR => {
                Some((*ty, const_offset(&module, hit, *addr).1))
            }
            _ => None,
        })
        .collect();
    assert!(loads.contains(&(Type::I32, frame_args::HIT_KIND)));
    assert!(loads.contains(&(Type::F32, frame_args::HIT_ATTRIBUTES + 4)));
}

#[test]
fn continuation_loads_dispatch_index_from_hot_zone() {
    let mut mb = test_module_builder();
    let root = declare_raygen(&mut mb, "main");
    let cont = declare_continuation(&mut mb, "main.cont", ShaderKind::RayGen, root);

    let mut builder = mb.func_builder(root);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let payload = builder.make_undef_value(GLOBAL_PTR);
    trace_ray(&mut builder, payload, ContRef { id: 1, func: cont });
    builder.ret(None);

    let mut builder = mb.func_builder(cont);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let first = builder.dispatch_ray_index(1);
    let second = builder.dispatch_ray_index(1);
    builder.add(first, second);
    builder.ret(None);
    let mut module = mb.build();
    lower(&mut module, &test_ctx());

    let func = &module.funcs[cont];
    let add = insts(&module, cont)
        .into_iter()
        .find(|inst| matches!(func.dfg.inst(*inst), InstData::Binary { code: BinaryOp::Add, .. }))
        .unwrap();
    let InstData::Binary { args, .. } = func.dfg.inst(add) else {
        unreachable!();
    };
    // Both queries share one load.
    assert_eq!(args[0], args[1]);
    let InstData::Load { addr, .. } = func.dfg.inst(func.dfg.value_inst(args[0]).unwrap()) else {
        panic!("dispatch index must be loaded");
    };
    let (base, offset) = const_offset(&module, cont, *addr);
    assert_eq!(rt_of(&module, cont, base), Some(RtInst::HotZonePtr));
    assert_eq!(offset, 8);
}

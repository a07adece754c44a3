//! Stack frame layout of a shader group.
//!
//! A frame consists of three regions in this order:
//!
//! 1. the argument region: the resume address and payload pointer of the
//!    caller, plus the hit kind and custom attributes of procedural hits.
//!    Raygen roots have no caller and an empty argument region.
//! 2. the alloca region: the non-private allocas of the root, in
//!    declaration order.
//! 3. the spill region: values living across suspension points.
//!
//! Each region is described by a packed struct and every function of the
//! group addresses its frame through `gep frame_ty [0, slot, index]`.
use raystack_ir::{
    shader::{FrameEntry, FrameEntryKind, HitGroupKind},
    types::{align_to, TypeStore},
    AddrSpace, BlockId, FuncRef, Function, InstData, InstId, Module, RtInst, ShaderKind, Type,
    ValueId,
};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{
    continuation::InstRef,
    context::RtContext,
    error::{LoweringError, LoweringResult},
    rt_builder::{RtBuilder, GLOBAL_PTR},
};

pub const ARG_SLOT: i32 = 0;
pub const ALLOCA_SLOT: i32 = 1;
pub const SPILL_SLOT: i32 = 2;

/// Packed layout a group of spills shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpillKey {
    Block(FuncRef, BlockId),
    Function(FuncRef),
}

impl SpillKey {
    fn func(self) -> FuncRef {
        match self {
            Self::Block(func, _) | Self::Function(func) => func,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    handle: InstRef,
    offset: u64,
    ty: Type,
}

/// A region struct under construction.
#[derive(Debug, Default)]
struct PackedFields {
    fields: Vec<Type>,
    end: u64,
}

impl PackedFields {
    /// Places `ty` at `offset`, inserting padding if `offset` lies past the
    /// current end. Returns the field index.
    fn push_at(&mut self, types: &mut TypeStore, offset: u64, ty: Type) -> u32 {
        debug_assert!(offset >= self.end);
        self.pad_to(types, offset);
        self.fields.push(ty);
        self.end = offset + types.size_of(ty) as u64;
        (self.fields.len() - 1) as u32
    }

    fn pad_to(&mut self, types: &mut TypeStore, offset: u64) {
        if offset > self.end {
            let pad = types.make_array(Type::I8, (offset - self.end) as usize);
            self.fields.push(pad);
            self.end = offset;
        }
    }
}

#[derive(Debug)]
enum LayoutState {
    Collecting,
    Finalized(FinalLayout),
}

#[derive(Debug, Default)]
struct FinalLayout {
    base_ty: Option<Type>,
    fill_tys: FxHashMap<FuncRef, Type>,
    spill_tys: FxHashMap<SpillKey, Type>,
    fill_index: FxHashMap<InstRef, u32>,
    spill_index: FxHashMap<InstRef, (SpillKey, u32)>,
}

#[derive(Debug)]
pub struct StackFrameInfo {
    root: FuncRef,
    root_name: String,
    kind: ShaderKind,
    frame_align: u64,
    compaction: bool,
    emit_entries: bool,

    arg_fields: Vec<Type>,
    arg_size: u64,

    /// Non-private allocas of the root in declaration order.
    allocas: Vec<Slot>,
    alloca_fields: PackedFields,
    alloca_index: Vec<u32>,

    fills: FxHashMap<FuncRef, Vec<Slot>>,
    spills: FxHashMap<SpillKey, Vec<Slot>>,
    /// Bytes used by the spill region.
    spill_size: u64,

    entries: Vec<FrameEntry>,
    state: LayoutState,
}

impl StackFrameInfo {
    pub fn new(module: &mut Module, ctx: &RtContext, root: FuncRef) -> LoweringResult<Self> {
        let root_name = module.func_name(root).to_string();
        let info = module
            .shader_info(root)
            .ok_or_else(|| LoweringError::MissingShaderInfo(root_name.clone()))?;
        let kind = info.kind;
        let procedural_bytes =
            (info.hit_group == HitGroupKind::Procedural).then_some(info.hit_attribute_bytes);

        let mut arg_fields = Vec::new();
        let mut entries = Vec::new();
        if kind.has_caller() {
            arg_fields.extend([Type::I64, GLOBAL_PTR]);
            entries.push(FrameEntry {
                kind: FrameEntryKind::ReturnIp,
                name: "return_ip".to_string(),
                offset: 0,
                size: 8,
                ty: "i64".to_string(),
            });
            entries.push(FrameEntry {
                kind: FrameEntryKind::Argument,
                name: "payload".to_string(),
                offset: 8,
                size: 8,
                ty: GLOBAL_PTR.to_string(),
            });
            if let Some(bytes) = procedural_bytes {
                arg_fields.push(Type::I32);
                if bytes > 0 {
                    let attrs = module
                        .types
                        .make_array(Type::I32, bytes.div_ceil(4) as usize);
                    arg_fields.push(attrs);
                }
            }
        }

        let mut args = PackedFields::default();
        for ty in &arg_fields {
            let end = args.end;
            args.push_at(&mut module.types, end, *ty);
        }
        // Keep the following regions 8-byte aligned.
        let arg_size = align_to(args.end as usize, 8) as u64;
        args.pad_to(&mut module.types, arg_size);

        Ok(Self {
            root,
            root_name,
            kind,
            frame_align: ctx.frame_align(),
            compaction: !ctx.config.disable_compaction,
            emit_entries: ctx.config.emit_layout_entries,
            arg_fields: args.fields,
            arg_size,
            allocas: Vec::new(),
            alloca_fields: PackedFields::default(),
            alloca_index: Vec::new(),
            fills: FxHashMap::default(),
            spills: FxHashMap::default(),
            spill_size: 0,
            entries,
            state: LayoutState::Collecting,
        })
    }

    /// Registers the allocas, fills and spills of `func_ref`.
    pub fn add_function(&mut self, module: &mut Module, func_ref: FuncRef) -> LoweringResult<()> {
        if matches!(self.state, LayoutState::Finalized(_)) {
            return Err(LoweringError::AlreadyFinalized(self.root_name.clone()));
        }

        let func = &module.funcs[func_ref];
        let mut allocas = Vec::new();
        let mut fills = Vec::new();
        let mut spills = Vec::new();
        for block in func.layout.iter_block() {
            for inst in func.layout.iter_inst(block) {
                let handle = InstRef::new(func_ref, inst);
                match func.dfg.inst(inst) {
                    InstData::Alloca {
                        ty,
                        addr_space: AddrSpace::Global,
                    } if func_ref == self.root => allocas.push((handle, *ty)),
                    InstData::Rt(RtInst::Fill { offset, ty }) => fills.push(Slot {
                        handle,
                        offset: *offset,
                        ty: *ty,
                    }),
                    InstData::Rt(RtInst::Spill { value, offset }) => {
                        let key = if self.compaction {
                            SpillKey::Block(func_ref, block)
                        } else {
                            SpillKey::Function(func_ref)
                        };
                        spills.push((
                            key,
                            Slot {
                                handle,
                                offset: *offset,
                                ty: func.dfg.value_ty(*value),
                            },
                        ));
                    }
                    _ => {}
                }
            }
        }

        let types = &mut module.types;
        for (handle, ty) in allocas {
            let align = types.align_of(ty) as u64;
            let offset = align_to(self.alloca_fields.end as usize, align as usize) as u64;
            let index = self.alloca_fields.push_at(types, offset, ty);
            let size = types.size_of(ty) as u64;
            self.entries.push(FrameEntry {
                kind: FrameEntryKind::Alloca,
                name: format!("alloca{}", self.allocas.len()),
                offset,
                size,
                ty: types.display(ty),
            });
            self.allocas.push(Slot { handle, offset, ty });
            self.alloca_index.push(index);
        }

        for slot in fills.iter().chain(spills.iter().map(|(_, slot)| slot)) {
            let end = slot.offset + types.size_of(slot.ty) as u64;
            self.spill_size = self.spill_size.max(end);
        }
        if !fills.is_empty() {
            self.fills.entry(func_ref).or_default().extend(fills);
        }
        for (key, slot) in spills {
            self.spills.entry(key).or_default().push(slot);
        }

        Ok(())
    }

    pub fn root(&self) -> FuncRef {
        self.root
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn arg_size(&self) -> u64 {
        self.arg_size
    }

    pub fn alloca_size(&self) -> u64 {
        align_to(self.alloca_fields.end as usize, 8) as u64
    }

    /// Byte offset of the spill region in the frame.
    pub fn spill_offset(&self) -> u64 {
        self.arg_size + self.alloca_size()
    }

    pub fn spill_size(&self) -> u64 {
        self.spill_size
    }

    pub fn frame_size(&self) -> u64 {
        align_to(
            (self.spill_offset() + self.spill_size) as usize,
            self.frame_align as usize,
        ) as u64
    }

    pub fn num_allocas(&self) -> usize {
        self.allocas.len()
    }

    /// Builds the frame types and fixes the index of every handle.
    pub fn finalize(&mut self, module: &mut Module) -> LoweringResult<()> {
        if matches!(self.state, LayoutState::Finalized(_)) {
            return Err(LoweringError::AlreadyFinalized(self.root_name.clone()));
        }

        let frame_size = self.frame_size();
        let spill_offset = self.spill_offset();
        let mut layout = FinalLayout::default();

        let types = &mut module.types;
        let args_ty =
            types.make_unique_struct(&format!("{}.args", self.root_name), &self.arg_fields, true);
        let alloca_size = self.alloca_size();
        self.alloca_fields.pad_to(types, alloca_size);
        let allocas_ty = types.make_unique_struct(
            &format!("{}.allocas", self.root_name),
            &self.alloca_fields.fields,
            true,
        );
        layout.base_ty = Some(types.make_unique_struct(
            &format!("{}.frame", self.root_name),
            &[args_ty, allocas_ty],
            true,
        ));

        let mut fill_funcs: Vec<_> = self.fills.keys().copied().collect();
        fill_funcs.sort();
        for func_ref in fill_funcs {
            let name = module.funcs[func_ref].sig.name().to_string();
            let slots = self.fills.get_mut(&func_ref).map(std::mem::take).unwrap_or_default();
            let (fields, index) = pack_deduped(&mut module.types, slots, |first, second| {
                LoweringError::OverlappingFills {
                    func: name.clone(),
                    first,
                    second,
                }
            })?;
            let region = module
                .types
                .make_unique_struct(&format!("{name}.fills"), &fields, true);
            let frame_ty = module.types.make_unique_struct(
                &format!("{name}.fill_frame"),
                &[args_ty, allocas_ty, region],
                true,
            );
            self.check_size(&module.types, &name, frame_ty, frame_size)?;
            layout.fill_tys.insert(func_ref, frame_ty);
            layout.fill_index.extend(index);
        }

        let mut spill_keys: Vec<_> = self.spills.keys().copied().collect();
        spill_keys.sort();
        for key in spill_keys {
            let func_name = module.funcs[key.func()].sig.name().to_string();
            let name = match key {
                SpillKey::Block(_, block) => format!("{func_name}.{block}"),
                SpillKey::Function(_) => func_name.clone(),
            };
            let slots = self.spills.get_mut(&key).map(std::mem::take).unwrap_or_default();
            let (fields, index) = pack_deduped(&mut module.types, slots, |first, second| {
                LoweringError::OverlappingSpills {
                    func: func_name.clone(),
                    first,
                    second,
                }
            })?;
            let region = module
                .types
                .make_unique_struct(&format!("{name}.spills"), &fields, true);
            let region_size = module.types.size_of(region) as u64;
            let frame_ty = module.types.make_unique_struct(
                &format!("{name}.spill_frame"),
                &[args_ty, allocas_ty, region],
                true,
            );
            self.check_size(&module.types, &func_name, frame_ty, frame_size)?;
            layout.spill_tys.insert(key, frame_ty);
            layout
                .spill_index
                .extend(index.into_iter().map(|(handle, idx)| (handle, (key, idx))));

            self.entries.push(FrameEntry {
                kind: FrameEntryKind::SpillUnion,
                name,
                offset: spill_offset,
                size: region_size,
                ty: module.types.display(region),
            });
        }

        // Alloca entries were recorded relative to their region.
        for entry in &mut self.entries {
            if entry.kind == FrameEntryKind::Alloca {
                entry.offset += self.arg_size;
            }
        }
        if self.emit_entries {
            if let Some(info) = module.shader_info_mut(self.root) {
                info.frame_entries = std::mem::take(&mut self.entries);
            }
        }

        debug!(
            root = %self.root_name,
            frame_size,
            spill_offset,
            "finalized stack frame layout"
        );
        self.state = LayoutState::Finalized(layout);
        Ok(())
    }

    fn check_size(
        &self,
        types: &TypeStore,
        func: &str,
        frame_ty: Type,
        frame_size: u64,
    ) -> LoweringResult<()> {
        let size = types.size_of(frame_ty) as u64;
        if size > frame_size {
            return Err(LoweringError::FrameOverflow {
                func: func.to_string(),
                size,
                frame_size,
            });
        }
        Ok(())
    }

    fn layout(&self) -> LoweringResult<&FinalLayout> {
        match &self.state {
            LayoutState::Finalized(layout) => Ok(layout),
            LayoutState::Collecting => Err(LoweringError::NotFinalized(self.root_name.clone())),
        }
    }

    fn unregistered(&self, module: &Module, handle: InstRef, kind: &'static str) -> LoweringError {
        LoweringError::UnregisteredHandle {
            func: module.func_name(handle.func).to_string(),
            kind,
        }
    }

    /// Address of the spill slot of `spill` together with its alignment.
    pub fn get_spill_ptr(
        &self,
        builder: &mut RtBuilder,
        frame_addr: ValueId,
        spill: InstRef,
    ) -> LoweringResult<(ValueId, u32)> {
        let layout = self.layout()?;
        let (key, index) = *layout
            .spill_index
            .get(&spill)
            .ok_or_else(|| self.unregistered(builder.module(), spill, "spill"))?;
        let frame_ty = layout.spill_tys[&key];
        Ok(self.slot_ptr(builder, frame_addr, frame_ty, SPILL_SLOT, index))
    }

    /// Address of the fill slot of `fill` together with its alignment.
    pub fn get_fill_ptr(
        &self,
        builder: &mut RtBuilder,
        frame_addr: ValueId,
        fill: InstRef,
    ) -> LoweringResult<(ValueId, u32)> {
        let layout = self.layout()?;
        let index = *layout
            .fill_index
            .get(&fill)
            .ok_or_else(|| self.unregistered(builder.module(), fill, "fill"))?;
        let frame_ty = layout.fill_tys[&fill.func];
        Ok(self.slot_ptr(builder, frame_addr, frame_ty, SPILL_SLOT, index))
    }

    /// Address of the `number`th alloca of the root.
    pub fn get_alloca_ptr(
        &self,
        builder: &mut RtBuilder,
        frame_addr: ValueId,
        number: u32,
    ) -> LoweringResult<ValueId> {
        let layout = self.layout()?;
        let index = *self.alloca_index.get(number as usize).ok_or_else(|| {
            LoweringError::UnregisteredHandle {
                func: builder.module().func_name(builder.func_ref()).to_string(),
                kind: "alloca",
            }
        })?;
        let frame_ty = layout.base_ty.ok_or_else(|| LoweringError::NotFinalized(self.root_name.clone()))?;
        Ok(self.slot_ptr(builder, frame_addr, frame_ty, ALLOCA_SLOT, index).0)
    }

    /// Number of the alloca `inst` of the root.
    pub fn alloca_number(&self, alloca: InstRef) -> Option<u32> {
        self.allocas
            .iter()
            .position(|slot| slot.handle == alloca)
            .map(|number| number as u32)
    }

    /// Frame relative byte offset of the `number`th alloca.
    pub fn alloca_offset(&self, number: u32) -> Option<u64> {
        self.allocas
            .get(number as usize)
            .map(|slot| self.arg_size + slot.offset)
    }

    fn slot_ptr(
        &self,
        builder: &mut RtBuilder,
        frame_addr: ValueId,
        frame_ty: Type,
        slot: i32,
        index: u32,
    ) -> (ValueId, u32) {
        let indices = [0, slot, index as i32];
        let offset = builder
            .types()
            .gep_offset(frame_ty, &indices.map(i64::from))
            .map(|(offset, _)| offset);
        let align = match offset {
            Some(offset) => access_align(self.frame_align, offset as u64),
            None => {
                warn!(
                    root = %self.root_name,
                    slot,
                    index,
                    "unresolved frame offset, falling back to byte alignment"
                );
                1
            }
        };

        let addr = builder.gep_const(frame_addr, frame_ty, &indices);
        (addr, align)
    }
}

/// Sorts `slots` by offset, merges slots sharing an offset and builds the
/// region fields. Slots overlapping at distinct offsets fail with the error
/// built by `overlap`.
fn pack_deduped(
    types: &mut TypeStore,
    mut slots: Vec<Slot>,
    overlap: impl Fn(u64, u64) -> LoweringError,
) -> LoweringResult<(Vec<Type>, Vec<(InstRef, u32)>)> {
    slots.sort_by_key(|slot| slot.offset);

    let mut fields = PackedFields::default();
    let mut index = Vec::with_capacity(slots.len());
    let mut prev: Option<(u64, u32, u64)> = None;
    for slot in slots {
        let size = types.size_of(slot.ty) as u64;
        match prev {
            Some((offset, idx, _)) if offset == slot.offset => {
                index.push((slot.handle, idx));
                continue;
            }
            Some((offset, _, end)) if slot.offset < end => {
                return Err(overlap(offset, slot.offset));
            }
            _ => {}
        }
        let idx = fields.push_at(types, slot.offset, slot.ty);
        index.push((slot.handle, idx));
        prev = Some((slot.offset, idx, slot.offset + size));
    }

    Ok((fields.fields, index))
}

/// Alignment of an access at `offset` of a frame aligned to `frame_align`.
pub fn access_align(frame_align: u64, offset: u64) -> u32 {
    gcd(frame_align, offset) as u32
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Non-private allocas of `func` in layout order.
pub fn global_allocas(func: &Function) -> Vec<InstId> {
    func
        .iter_insts()
        .filter(|&inst| {
            matches!(
                func.dfg.inst(inst),
                InstData::Alloca {
                    addr_space: AddrSpace::Global,
                    ..
                }
            )
        })
        .collect()
}

use indexmap::{IndexMap, IndexSet};
use raystack_ir::{BlockId, FuncRef, Function, InstId, Module, RtInst, ShaderKind};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{ContinuationMap, InstRef, ValueRef};
use crate::{
    context::RtContext,
    error::{LoweringError, LoweringResult},
};

/// Spill/fill pairing of one shader group.
#[derive(Debug)]
pub struct ContinuationInfo {
    root: FuncRef,
    kind: ShaderKind,
    group: ContinuationMap,
    /// Fill to the spills that feed it.
    spill_fills: IndexMap<InstRef, Vec<InstRef>>,
    suspend_points: IndexMap<FuncRef, Vec<InstId>>,
    /// Continuation to the blocks that suspend into it.
    suspend_blocks: IndexMap<FuncRef, IndexSet<(FuncRef, BlockId)>>,
    dead: FxHashSet<InstRef>,
}

impl ContinuationInfo {
    pub fn calculate(
        module: &Module,
        root: FuncRef,
        group: ContinuationMap,
    ) -> LoweringResult<Self> {
        let kind = module
            .shader_info(root)
            .ok_or_else(|| LoweringError::MissingShaderInfo(module.func_name(root).to_string()))?
            .kind;

        let mut info = Self {
            root,
            kind,
            group,
            spill_fills: IndexMap::default(),
            suspend_points: IndexMap::default(),
            suspend_blocks: IndexMap::default(),
            dead: FxHashSet::default(),
        };

        let funcs: Vec<_> = info.functions().collect();
        for func_ref in funcs {
            info.scan_function(module, func_ref)?;
        }

        Ok(info)
    }

    fn scan_function(&mut self, module: &Module, func_ref: FuncRef) -> LoweringResult<()> {
        let func = &module.funcs[func_ref];
        let points = self.suspend_points.entry(func_ref).or_default();

        for block in func.layout.iter_block() {
            let mut spills: FxHashMap<u64, InstId> = FxHashMap::default();

            for inst in func.layout.iter_inst(block) {
                if let Some(RtInst::Spill { offset, .. }) = func.dfg.rt(inst) {
                    spills.insert(*offset, inst);
                    continue;
                }

                let Some(cont) = func.dfg.inst(inst).suspend_target() else {
                    continue;
                };
                points.push(inst);
                self.suspend_blocks
                    .entry(cont.func)
                    .or_default()
                    .insert((func_ref, block));

                for (fill, offset) in entry_fills(&module.funcs[cont.func]) {
                    let Some(&spill) = spills.get(&offset) else {
                        return Err(LoweringError::UnmatchedFill {
                            func: module.func_name(cont.func).to_string(),
                            caller: module.func_name(func_ref).to_string(),
                            offset,
                        });
                    };
                    self.spill_fills
                        .entry(InstRef::new(cont.func, fill))
                        .or_default()
                        .push(InstRef::new(func_ref, spill));
                }
                spills.clear();
            }
        }

        Ok(())
    }

    pub fn root(&self) -> FuncRef {
        self.root
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn group(&self) -> &ContinuationMap {
        &self.group
    }

    pub fn num_continuations(&self) -> usize {
        self.group.len()
    }

    /// The root followed by every continuation of the group.
    pub fn functions(&self) -> impl Iterator<Item = FuncRef> + '_ {
        std::iter::once(self.root).chain(self.group.values().copied())
    }

    /// Live fills of the group.
    pub fn fills(&self) -> impl Iterator<Item = InstRef> + '_ {
        self.spill_fills
            .keys()
            .copied()
            .filter(|fill| !self.dead.contains(fill))
    }

    pub fn spills_of(&self, fill: InstRef) -> &[InstRef] {
        self.spill_fills.get(&fill).map_or(&[], |spills| spills)
    }

    /// Maps every spill to the fill it feeds.
    pub fn spill_to_fill(&self) -> FxHashMap<InstRef, InstRef> {
        self.fills()
            .flat_map(|fill| self.spills_of(fill).iter().map(move |spill| (*spill, fill)))
            .collect()
    }

    pub fn suspend_points(&self, func: FuncRef) -> &[InstId] {
        self.suspend_points.get(&func).map_or(&[], |points| points)
    }

    /// Blocks that suspend into `cont`.
    pub fn suspend_blocks(&self, cont: FuncRef) -> impl Iterator<Item = (FuncRef, BlockId)> + '_ {
        self.suspend_blocks
            .get(&cont)
            .into_iter()
            .flat_map(|blocks| blocks.iter().copied())
    }

    /// Unwraps fills to the value that was originally spilled. Returns `None`
    /// unless every path resolves to the very same value.
    pub fn find_unique_spill_root(&self, module: &Module, value: ValueRef) -> Option<ValueRef> {
        let mut visited = FxHashSet::default();
        let mut roots = IndexSet::new();
        self.collect_spill_roots(module, value, &mut visited, &mut roots);

        match roots.len() {
            1 => roots.pop(),
            _ => None,
        }
    }

    fn collect_spill_roots(
        &self,
        module: &Module,
        value: ValueRef,
        visited: &mut FxHashSet<InstRef>,
        roots: &mut IndexSet<ValueRef>,
    ) {
        let dfg = &module.funcs[value.func].dfg;
        let fill = match dfg.value_inst(value.value) {
            Some(inst) if matches!(dfg.rt(inst), Some(RtInst::Fill { .. })) => {
                InstRef::new(value.func, inst)
            }
            _ => {
                roots.insert(value);
                return;
            }
        };

        // Self-looping continuations feed a fill with its own value.
        if !visited.insert(fill) {
            return;
        }

        let Some(spills) = self.spill_fills.get(&fill) else {
            roots.insert(value);
            return;
        };
        for spill in spills {
            if let Some(RtInst::Spill { value, .. }) = module.funcs[spill.func].dfg.rt(spill.inst) {
                self.collect_spill_roots(module, ValueRef::new(spill.func, *value), visited, roots);
            }
        }
    }

    /// Marks `fill` dead. The index is only updated by [`Self::bulk_update`].
    pub fn mark_dead(&mut self, fill: InstRef) {
        self.dead.insert(fill);
    }

    pub fn is_dead(&self, fill: InstRef) -> bool {
        self.dead.contains(&fill)
    }

    /// Drops every fill marked dead from the index.
    pub fn bulk_update(&mut self) {
        if self.dead.is_empty() {
            return;
        }
        let dead = std::mem::take(&mut self.dead);
        self.spill_fills.retain(|fill, _| !dead.contains(fill));
    }

    /// Returns `true` if continuations of the group can be promoted to
    /// shader identifier slots.
    pub fn can_promote(&self, ctx: &RtContext) -> bool {
        self.kind == ShaderKind::RayGen
            && self.num_continuations() <= ctx.caps.open_raygen_slots() as usize
            && ctx.config.indirect_continuations
    }
}

/// Fills in the entry block of `func` with their offsets.
pub fn entry_fills(func: &Function) -> Vec<(InstId, u64)> {
    let Some(entry) = func.layout.entry_block() else {
        return Vec::new();
    };
    func.layout
        .iter_inst(entry)
        .filter_map(|inst| match func.dfg.rt(inst) {
            Some(RtInst::Fill { offset, .. }) => Some((inst, *offset)),
            _ => None,
        })
        .collect()
}

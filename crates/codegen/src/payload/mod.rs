//! Payload analyses working on constant byte intervals of the payload
//! pointer.
//!
//! A payload access is only tracked when its address is derived from the
//! payload base through constant address arithmetic. Any other use of the
//! payload pointer makes the whole function opaque to these analyses.
mod dead_store;
mod sinking;

pub use dead_store::eliminate_dead_stores;
pub use sinking::{check_sinking_ambiguity, has_ambiguous_payload_branch, PayloadSinking};

use raystack_ir::{
    inst::CastOp, types::TypeStore, ControlFlowGraph, Function, InstData, InstId, RtInst, ValueId,
};
use smallvec::SmallVec;

/// Half open byte range `[offset, offset + size)` of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadInterval {
    pub offset: u64,
    pub size: u64,
}

impl PayloadInterval {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(self) -> u64 {
        self.offset + self.size
    }

    pub fn overlaps(self, other: Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Returns `true` if every byte of `other` lies in `self`.
    pub fn covers(self, other: Self) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadAccess {
    pub inst: InstId,
    pub kind: AccessKind,
    pub interval: PayloadInterval,
    /// Address arithmetic leading from the payload base to the accessed
    /// address, in evaluation order.
    pub chain: SmallVec<[InstId; 4]>,
}

impl PayloadAccess {
    pub fn is_load(&self) -> bool {
        self.kind == AccessKind::Load
    }

    pub fn is_store(&self) -> bool {
        self.kind == AccessKind::Store
    }
}

/// The payload pointer of `func`: the result of its single payload
/// placeholder or payload pointer marker.
pub fn payload_base(func: &Function) -> Option<ValueId> {
    let mut bases = func
        .iter_insts()
        .filter(|inst| {
            matches!(
                func.dfg.rt(*inst),
                Some(RtInst::Payload | RtInst::PayloadPtr { .. })
            )
        });
    let base = bases.next()?;
    if bases.next().is_some() {
        return None;
    }
    func.dfg.inst_result(base)
}

/// Collects every load and store through `base`.
///
/// Returns `None` when the payload pointer escapes or is offset by a
/// non-constant amount.
pub fn payload_accesses(
    func: &Function,
    types: &TypeStore,
    base: ValueId,
) -> Option<Vec<PayloadAccess>> {
    let mut accesses = Vec::new();
    let mut worklist: Vec<(ValueId, u64, SmallVec<[InstId; 4]>)> =
        vec![(base, 0, SmallVec::new())];

    while let Some((addr, offset, chain)) = worklist.pop() {
        for &user in func.dfg.users(addr) {
            if !func.layout.is_inst_inserted(user) {
                continue;
            }

            match func.dfg.inst(user) {
                InstData::Load { addr: a, ty, .. } if *a == addr => {
                    accesses.push(PayloadAccess {
                        inst: user,
                        kind: AccessKind::Load,
                        interval: PayloadInterval::new(offset, types.size_of(*ty) as u64),
                        chain: chain.clone(),
                    });
                }
                InstData::Store {
                    addr: a, value, ..
                } if *a == addr && *value != addr => {
                    let size = types.size_of(func.dfg.value_ty(*value)) as u64;
                    accesses.push(PayloadAccess {
                        inst: user,
                        kind: AccessKind::Store,
                        interval: PayloadInterval::new(offset, size),
                        chain: chain.clone(),
                    });
                }
                InstData::Gep {
                    base: b,
                    elem_ty,
                    indices,
                } if *b == addr => {
                    let indices = indices
                        .iter()
                        .map(|idx| func.dfg.value_imm(*idx)?.as_i64())
                        .collect::<Option<SmallVec<[i64; 4]>>>()?;
                    let (step, _) = types.gep_offset(*elem_ty, &indices)?;
                    let offset = u64::try_from(offset as i64 + step).ok()?;
                    let mut chain = chain.clone();
                    chain.push(user);
                    worklist.push((func.dfg.inst_result(user)?, offset, chain));
                }
                InstData::Cast {
                    code: CastOp::Bitcast,
                    ..
                } => {
                    let mut chain = chain.clone();
                    chain.push(user);
                    worklist.push((func.dfg.inst_result(user)?, offset, chain));
                }
                _ => return None,
            }
        }
    }

    accesses.sort_by_key(|access| access.inst);
    Some(accesses)
}

/// Returns `true` if `to` may execute after `from`.
pub(crate) fn inst_reaches(
    func: &Function,
    cfg: &ControlFlowGraph,
    from: InstId,
    to: InstId,
) -> bool {
    let from_block = func.layout.inst_block(from);
    let to_block = func.layout.inst_block(to);
    if from_block == to_block && func.layout.is_before_in_block(from, to) {
        return true;
    }
    cfg.succs_of(from_block)
        .any(|succ| cfg.reachable_from(*succ).contains(&to_block))
}

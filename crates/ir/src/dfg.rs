//! This module contains the IR data flow graph.
use std::collections::BTreeSet;

use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::inst::{InstData, InstId, RtInst};

use super::{Immediate, Type, Value, ValueId};

#[derive(Debug, Default)]
pub struct DataFlowGraph {
    #[doc(hidden)]
    pub blocks: PrimaryMap<BlockId, Block>,
    #[doc(hidden)]
    pub values: PrimaryMap<ValueId, Value>,
    insts: PrimaryMap<InstId, InstData>,
    inst_results: SecondaryMap<InstId, PackedOption<ValueId>>,
    #[doc(hidden)]
    pub immediates: FxHashMap<Immediate, ValueId>,
    undefs: FxHashMap<Type, ValueId>,
    users: SecondaryMap<ValueId, BTreeSet<InstId>>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_block(&mut self) -> BlockId {
        self.blocks.push(Block::new())
    }

    pub fn make_value(&mut self, value: Value) -> ValueId {
        self.values.push(value)
    }

    pub fn make_inst(&mut self, data: InstData) -> InstId {
        let inst_id = self.insts.push(data);
        self.attach_user(inst_id);
        inst_id
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> ValueId
    where
        Imm: Into<Immediate>,
    {
        let imm: Immediate = imm.into();
        if let Some(&value) = self.immediates.get(&imm) {
            return value;
        }

        let ty = imm.ty();
        let value = self.make_value(Value::Immediate { imm, ty });
        self.immediates.insert(imm, value);
        value
    }

    pub fn make_undef_value(&mut self, ty: Type) -> ValueId {
        if let Some(&value) = self.undefs.get(&ty) {
            return value;
        }

        let value = self.make_value(Value::Undef { ty });
        self.undefs.insert(ty, value);
        value
    }

    pub fn make_arg_value(&mut self, ty: Type, idx: usize) -> Value {
        Value::Arg { ty, idx }
    }

    /// Makes a result value of type `ty` for `inst_id` and attaches it.
    pub fn make_result(&mut self, inst_id: InstId, ty: Type) -> ValueId {
        let value = self.make_value(Value::Inst { inst: inst_id, ty });
        self.attach_result(inst_id, value);
        value
    }

    pub fn replace_inst(&mut self, inst_id: InstId, new: InstData) {
        let old = std::mem::replace(&mut self.insts[inst_id], new);

        // Remove the arguments of the old inst from the user set.
        old.visit_values(&mut |value| {
            self.users[value].remove(&inst_id);
        });

        // Attach new inst.
        self.attach_user(inst_id);
    }

    /// Mutates the instruction in place keeping the user sets consistent.
    pub fn update_inst(&mut self, inst_id: InstId, f: impl FnOnce(&mut InstData)) {
        self.untrack_inst(inst_id);
        f(&mut self.insts[inst_id]);
        self.attach_user(inst_id);
    }

    pub fn attach_result(&mut self, inst_id: InstId, value_id: ValueId) {
        debug_assert!(self.inst_results[inst_id].is_none());
        self.inst_results[inst_id] = value_id.into();
    }

    pub fn inst(&self, inst_id: InstId) -> &InstData {
        &self.insts[inst_id]
    }

    pub fn rt(&self, inst_id: InstId) -> Option<&RtInst> {
        self.insts[inst_id].rt()
    }

    pub fn value(&self, value_id: ValueId) -> &Value {
        &self.values[value_id]
    }

    pub fn value_ty(&self, value_id: ValueId) -> Type {
        self.values[value_id].ty()
    }

    /// Returns the instruction defining `value_id`.
    pub fn value_inst(&self, value_id: ValueId) -> Option<InstId> {
        match self.values[value_id] {
            Value::Inst { inst, .. } => Some(inst),
            _ => None,
        }
    }

    pub fn value_imm(&self, value_id: ValueId) -> Option<Immediate> {
        match self.values[value_id] {
            Value::Immediate { imm, .. } => Some(imm),
            _ => None,
        }
    }

    pub fn is_imm(&self, value_id: ValueId) -> bool {
        self.value_imm(value_id).is_some()
    }

    pub fn attach_user(&mut self, inst_id: InstId) {
        let inst = &self.insts[inst_id];
        inst.visit_values(&mut |value| {
            self.users[value].insert(inst_id);
        })
    }

    pub fn untrack_inst(&mut self, inst_id: InstId) {
        let inst = &self.insts[inst_id];
        inst.visit_values(&mut |value| {
            self.users[value].remove(&inst_id);
        })
    }

    pub fn remove_user(&mut self, value: ValueId, user: InstId) {
        self.users[value].remove(&user);
    }

    /// Returns the all instructions that use the `value_id`.
    pub fn users(&self, value_id: ValueId) -> impl Iterator<Item = &InstId> {
        self.users[value_id].iter()
    }

    /// Returns the number of instructions that use the `value_id`.
    pub fn users_num(&self, value_id: ValueId) -> usize {
        self.users[value_id].len()
    }

    pub fn inst_result(&self, inst_id: InstId) -> Option<ValueId> {
        self.inst_results[inst_id].expand()
    }

    pub fn branch_dests(&self, inst: InstId) -> Option<SmallVec<[BlockId; 4]>> {
        self.inst(inst).branch_dests()
    }

    pub fn is_terminator(&self, inst: InstId) -> bool {
        self.inst(inst).is_terminator()
    }

    pub fn is_exit(&self, inst: InstId) -> bool {
        self.is_terminator(inst) && self.branch_dests(inst).is_none()
    }

    pub fn is_phi(&self, inst: InstId) -> bool {
        self.inst(inst).is_phi()
    }

    /// Replaces every use of `value` with `alias`.
    pub fn change_to_alias(&mut self, value: ValueId, alias: ValueId) {
        let mut users = std::mem::take(&mut self.users[value]);
        for inst in &users {
            self.insts[*inst].visit_values_mut(&mut |user_value| {
                if *user_value == value {
                    *user_value = alias;
                }
            });
        }
        self.users[alias].append(&mut users);
    }

    /// Rewrites the incoming block of phi arguments in `inst_id` from `from`
    /// to `to`.
    pub fn rewrite_phi_pred(&mut self, inst_id: InstId, from: BlockId, to: BlockId) {
        if let InstData::Phi { args, .. } = &mut self.insts[inst_id] {
            for (_, block) in args.iter_mut() {
                if *block == from {
                    *block = to;
                }
            }
        }
    }
}

/// An opaque reference to [`Block`]
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// A block data definition.
/// A Block data doesn't hold any information for layout of a program. It is managed by
/// [`super::layout::Layout`].
#[derive(Debug, Clone, Default)]
pub struct Block {}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }
}

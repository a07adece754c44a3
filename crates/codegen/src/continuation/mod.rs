//! Root/continuation shader groups and the spill/fill pairing between them.
mod graph;
mod info;

pub use graph::{
    continuation_group, root_functions, suspend_points, ContinuationGraph, ContinuationMap,
};
pub use info::{entry_fills, ContinuationInfo};

use raystack_ir::{FuncRef, InstId, ValueId};

/// An instruction of some function in the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstRef {
    pub func: FuncRef,
    pub inst: InstId,
}

impl InstRef {
    pub fn new(func: FuncRef, inst: InstId) -> Self {
        Self { func, inst }
    }
}

/// A value of some function in the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef {
    pub func: FuncRef,
    pub value: ValueId,
}

impl ValueRef {
    pub fn new(func: FuncRef, value: ValueId) -> Self {
        Self { func, value }
    }
}

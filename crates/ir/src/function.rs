use smallvec::SmallVec;

use super::{DataFlowGraph, InstId, Layout, RtInst, Type, ValueId};

#[derive(Debug)]
pub struct Function {
    /// Signature of the function.
    pub sig: Signature,
    pub arg_values: SmallVec<[ValueId; 8]>,
    pub dfg: DataFlowGraph,
    pub layout: Layout,
}

impl Function {
    pub fn new(sig: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let arg_values = sig
            .args()
            .iter()
            .enumerate()
            .map(|(idx, arg_ty)| {
                let value = dfg.make_arg_value(*arg_ty, idx);
                dfg.make_value(value)
            })
            .collect();

        Self {
            sig,
            arg_values,
            dfg,
            layout: Layout::default(),
        }
    }

    /// Returns `true` if the function has no body.
    pub fn is_declaration(&self) -> bool {
        self.layout.entry_block().is_none()
    }

    /// Instructions in layout order.
    pub fn iter_insts(&self) -> impl Iterator<Item = InstId> + '_ {
        self.layout.iter_block().flat_map(|block| self.layout.iter_inst(block))
    }

    /// Ray tracing instructions in layout order.
    pub fn rt_insts(&self) -> impl Iterator<Item = (InstId, &RtInst)> + '_ {
        self.iter_insts().filter_map(|inst| Some((inst, self.dfg.rt(inst)?)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    /// Name of the function.
    name: String,

    args: SmallVec<[Type; 8]>,
    ret_ty: Type,
}

impl Signature {
    pub fn new(name: &str, args: &[Type], ret_ty: Type) -> Self {
        Self {
            name: name.to_string(),
            args: args.into(),
            ret_ty,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Type] {
        &self.args
    }

    pub fn ret_ty(&self) -> Type {
        self.ret_ty
    }
}

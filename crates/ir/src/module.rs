use cranelift_entity::{entity_impl, PrimaryMap};
use raystack_triple::TargetTriple;
use rustc_hash::FxHashMap;

use crate::{shader::ShaderInfo, types::TypeStore, Function, Signature};

#[derive(Debug)]
pub struct Module {
    /// Target of the module.
    pub triple: TargetTriple,

    /// Holds all function declared in the module.
    pub funcs: PrimaryMap<FuncRef, Function>,

    pub types: TypeStore,

    /// Ray-tracing metadata of shader functions.
    pub shaders: FxHashMap<FuncRef, ShaderInfo>,
}

impl Module {
    #[doc(hidden)]
    pub fn new(triple: TargetTriple) -> Self {
        Self {
            triple,
            funcs: PrimaryMap::default(),
            types: TypeStore::default(),
            shaders: FxHashMap::default(),
        }
    }

    pub fn declare_function(&mut self, sig: Signature) -> FuncRef {
        self.funcs.push(Function::new(sig))
    }

    /// Returns `func_ref` in the module.
    pub fn iter_functions(&self) -> impl Iterator<Item = FuncRef> {
        self.funcs.keys()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncRef> {
        self.funcs
            .iter()
            .find_map(|(func_ref, func)| (func.sig.name() == name).then_some(func_ref))
    }

    pub fn func_name(&self, func_ref: FuncRef) -> &str {
        self.funcs[func_ref].sig.name()
    }

    pub fn shader_info(&self, func_ref: FuncRef) -> Option<&ShaderInfo> {
        self.shaders.get(&func_ref)
    }

    pub fn shader_info_mut(&mut self, func_ref: FuncRef) -> Option<&mut ShaderInfo> {
        self.shaders.get_mut(&func_ref)
    }

    pub fn is_continuation(&self, func_ref: FuncRef) -> bool {
        self.shader_info(func_ref)
            .is_some_and(|info| info.is_continuation)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "func");

use raystack_triple::TargetTriple;

use super::FunctionBuilder;
use crate::{
    func_cursor::{CursorLocation, FuncCursor, InstInserter},
    module::FuncRef,
    shader::ShaderInfo,
    Module, Signature, Type,
};

pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(triple: TargetTriple) -> Self {
        Self {
            module: Module::new(triple),
        }
    }

    /// Declares a function. Declaring the same name twice returns the
    /// existing function.
    pub fn declare_function(&mut self, sig: Signature) -> FuncRef {
        if let Some(func_ref) = self.module.func_by_name(sig.name()) {
            return func_ref;
        }
        self.module.declare_function(sig)
    }

    pub fn lookup_func(&self, name: &str) -> Option<FuncRef> {
        self.module.func_by_name(name)
    }

    /// Declares a shader function and attaches its metadata.
    pub fn declare_shader(&mut self, sig: Signature, info: ShaderInfo) -> FuncRef {
        let func_ref = self.declare_function(sig);
        self.module.shaders.insert(func_ref, info);
        func_ref
    }

    pub fn set_shader_info(&mut self, func_ref: FuncRef, info: ShaderInfo) {
        self.module.shaders.insert(func_ref, info);
    }

    pub fn declare_struct_type(&mut self, name: &str, fields: &[Type], packed: bool) -> Type {
        self.module.types.make_struct(name, fields, packed)
    }

    pub fn declare_array_type(&mut self, elem: Type, len: usize) -> Type {
        self.module.types.make_array(elem, len)
    }

    pub fn declare_vector_type(&mut self, elem: Type, len: usize) -> Type {
        self.module.types.make_vector(elem, len)
    }

    pub fn func_builder(&mut self, func: FuncRef) -> FunctionBuilder<'_, InstInserter> {
        let cursor = InstInserter::at_location(CursorLocation::NoWhere);
        FunctionBuilder::new(&mut self.module, func, cursor)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn build(self) -> Module {
        self.module
    }
}

mod func_builder;
mod module_builder;

pub use func_builder::FunctionBuilder;
pub use module_builder::ModuleBuilder;

pub mod test_util {
    use super::*;

    use raystack_triple::TargetTriple;

    use crate::{ir_writer::FuncWriter, module::FuncRef, Module};

    pub fn build_test_triple() -> TargetTriple {
        TargetTriple::parse("xe-dg2-async").unwrap()
    }

    pub fn test_module_builder() -> ModuleBuilder {
        ModuleBuilder::new(build_test_triple())
    }

    pub fn dump_func(module: &Module, func_ref: FuncRef) -> String {
        let mut writer = FuncWriter::new(module, func_ref);
        writer.dump_string().unwrap()
    }
}

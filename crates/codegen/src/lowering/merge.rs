use raystack_ir::{
    func_cursor::CursorLocation, inst::ContRef, BlockId, FuncRef, InstId, Module, Signature, Type,
    ValueId,
};
use tracing::debug;

use super::{is_return, FuncRole, FuncState, IntrinsicLowering, MERGE_FUNC_NAME};
use crate::{rt_builder::RtBuilder, rt_format::frame_args};

impl IntrinsicLowering<'_> {
    /// Calls the merge helper before every return of a shader that resumes
    /// its caller, unless the return block already suspended.
    pub(super) fn emit_merge_calls(&mut self, module: &mut Module, state: &FuncState) {
        if !state.kind.returns_to_continuation() {
            return;
        }

        let func = &module.funcs[state.func];
        let returns: Vec<InstId> = func
            .layout
            .iter_block()
            .filter_map(|block| {
                let term = func.layout.last_inst_of(block)?;
                let suspends = func
                    .layout
                    .iter_inst(block)
                    .any(|inst| func.dfg.inst(inst).suspend_target().is_some());
                (is_return(func, term) && !suspends).then_some(term)
            })
            .collect();
        if returns.is_empty() {
            return;
        }

        let merge = self.declare_merge_func(module);
        for ret in returns {
            let mut builder = RtBuilder::before(module, state.func, ret);
            if state.role == FuncRole::Continuation {
                builder.set_stack_offset(state.prologue.frame_offset);
            }
            let return_addr = self.return_address(&mut builder, state);
            builder.call(merge, &[return_addr]);
        }
    }

    fn return_address(&self, builder: &mut RtBuilder, state: &FuncState) -> ValueId {
        match self.unique_cont {
            Some((id, func)) => self.resume_address(builder, ContRef { id, func }),
            None => builder.load_at(state.prologue.frame_addr, frame_args::RETURN_IP, Type::I64),
        }
    }

    fn declare_merge_func(&mut self, module: &mut Module) -> FuncRef {
        *self.merge_func.get_or_insert_with(|| {
            module.declare_function(Signature::new(MERGE_FUNC_NAME, &[Type::I64], Type::Unit))
        })
    }

    /// Gives the merge helper its body once every continuation is known.
    pub(super) fn build_merge_func(&self, module: &mut Module) {
        let Some(merge) = self.merge_func else {
            return;
        };
        let conts: Vec<_> = self.cont_ids.iter().map(|(id, func)| (*id, *func)).collect();

        let mut builder = RtBuilder::at(module, merge, CursorLocation::NoWhere);
        let entry = builder.append_block();
        builder.switch_to_block(entry);
        let target = builder.args()[0];

        if self.ctx.config.indirect_continuations {
            builder.btd_call(target);
            builder.ret(None);
            debug!("merge helper resumes through bindless dispatch");
            return;
        }
        if conts.is_empty() {
            builder.ret(None);
            return;
        }

        let default = builder.append_block();
        let cases: Vec<(u64, BlockId)> = conts
            .iter()
            .map(|(id, _)| (u64::from(*id), builder.append_block()))
            .collect();
        builder.switch(target, default, &cases);

        for ((_, block), (_, cont)) in cases.iter().zip(&conts) {
            builder.switch_to_block(*block);
            let arg_tys = builder.module().funcs[*cont].sig.args().to_vec();
            let args: Vec<_> = arg_tys
                .into_iter()
                .map(|ty| builder.make_undef_value(ty))
                .collect();
            builder.call(*cont, &args);
            builder.ret(None);
        }
        builder.switch_to_block(default);
        builder.unreachable();

        debug!(cases = cases.len(), "merge helper switches over continuation ids");
    }
}

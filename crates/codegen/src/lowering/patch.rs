use raystack_ir::{FuncRef, Module, RtInst};
use tracing::debug;

use super::{placeholders, IntrinsicLowering};
use crate::{
    cfg_edit::{erase_inst, replace_inst_with},
    rt_builder::RtBuilder,
};

impl IntrinsicLowering<'_> {
    /// Payload offset every suspension into `cont` agrees on.
    fn unique_payload_offset(&self, cont: FuncRef) -> Option<u64> {
        let offsets = self.payload_offsets.get(&cont)?;
        if offsets.len() != 1 {
            return None;
        }
        offsets.first().copied().flatten()
    }

    /// Records the payload offset on every signpost, or drops all of them
    /// when one continuation has no single payload offset.
    pub(super) fn patch_signposts(&mut self, module: &mut Module) {
        let signposts = std::mem::take(&mut self.signposts);
        let offsets: Option<Vec<u64>> = signposts
            .iter()
            .map(|signpost| self.unique_payload_offset(signpost.func))
            .collect();

        match offsets {
            Some(offsets) => {
                for (signpost, payload_offset) in signposts.iter().zip(offsets) {
                    module.funcs[signpost.func]
                        .dfg
                        .update_inst(signpost.inst, |data| {
                            if let Some(RtInst::Signpost { offset, .. }) = data.rt_mut() {
                                *offset = Some(payload_offset);
                            }
                        });
                }
            }
            None => {
                debug!(
                    signposts = signposts.len(),
                    "payload offsets disagree, dropping signposts"
                );
                for signpost in signposts {
                    let func = &mut module.funcs[signpost.func];
                    if let Some(RtInst::Signpost { frame_addr, .. }) = func.dfg.rt(signpost.inst) {
                        let frame_addr = *frame_addr;
                        replace_inst_with(func, signpost.inst, frame_addr);
                    }
                }
            }
        }
    }

    /// Points the payload of every root straight into the frame of the
    /// unique continuation's parent. The payload pointers written into
    /// callee frames are dead afterwards.
    pub(super) fn patch_payloads(&mut self, module: &mut Module) {
        let stores = std::mem::take(&mut self.next_frame_stores);
        let Some((_, cont)) = self.unique_cont else {
            return;
        };
        let Some(offset) = self.unique_payload_offset(cont) else {
            return;
        };
        let Some(parent) = module.shader_info(cont).and_then(|info| info.parent) else {
            return;
        };
        let stack_size = module.shader_info(parent).map_or(0, |info| info.stack_size);
        let distance = stack_size as i64 - offset as i64;

        let funcs: Vec<_> = module.iter_functions().collect();
        for func in funcs {
            let payload_ptrs = placeholders(&module.funcs[func], |rt| match rt {
                RtInst::PayloadPtr { frame_addr, .. } => Some(*frame_addr),
                _ => None,
            });
            for (inst, frame_addr) in payload_ptrs {
                let mut builder = RtBuilder::before(module, func, inst);
                let sunk = builder.offset_ptr(frame_addr, -distance);
                builder.func_mut().dfg.update_inst(inst, |data| {
                    if let Some(RtInst::PayloadPtr { payload, .. }) = data.rt_mut() {
                        *payload = sunk;
                    }
                });
            }
        }

        for store in &stores {
            erase_inst(&mut module.funcs[store.func], store.inst);
        }
        debug!(
            distance,
            stores = stores.len(),
            "payload pointers rebased on the caller frame"
        );
    }
}

/// Replaces every surviving payload pointer and signpost marker with the
/// value it wraps.
pub fn strip_markers(module: &mut Module) {
    let funcs: Vec<_> = module.iter_functions().collect();
    for func_ref in funcs {
        let func = &mut module.funcs[func_ref];
        let markers = placeholders(func, |rt| match rt {
            RtInst::PayloadPtr { payload, .. } => Some(*payload),
            RtInst::Signpost { frame_addr, .. } => Some(*frame_addr),
            _ => None,
        });
        for (inst, value) in markers {
            replace_inst_with(func, inst, value);
        }
    }
}

use raystack_triple::{RtCaps, TargetTriple};
use tracing::warn;

use crate::config::LoweringConfig;

/// State shared by every pass of one compilation.
#[derive(Debug, Clone)]
pub struct RtContext {
    pub triple: TargetTriple,
    pub caps: RtCaps,
    pub config: LoweringConfig,
    /// Set once a shader with ambiguous payload-dependent control flow is
    /// seen. Payload sinking is not attempted again afterwards.
    pub payload_sinking_blocked: bool,
}

impl RtContext {
    pub fn new(triple: TargetTriple, config: LoweringConfig) -> Self {
        let caps = triple.caps();
        Self {
            triple,
            caps,
            config,
            payload_sinking_blocked: false,
        }
    }

    /// Alignment of every stack frame. Falls back to byte alignment when
    /// the capabilities carry no usable power of two.
    pub fn frame_align(&self) -> u64 {
        let align = self.caps.stack_frame_align as u64;
        if align.is_power_of_two() {
            align
        } else {
            warn!(align, "unusable stack frame alignment, using byte alignment");
            1
        }
    }
}

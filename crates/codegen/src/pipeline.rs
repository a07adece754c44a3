//! Pass pipeline turning split ray-tracing shaders into lowered code.
//!
//! [`Step`] is one pass of the pipeline. [`RayTracingPipeline`] holds an
//! ordered sequence of steps together with the compilation context and runs
//! them against a module.

use raystack_ir::{FuncRef, Module};
use tracing::{debug, instrument};

use crate::{
    context::RtContext,
    error::LoweringResult,
    late_remat::LateRemat,
    lowering::{strip_markers, IntrinsicLowering},
    payload::{check_sinking_ambiguity, eliminate_dead_stores, PayloadSinking},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Replace fills by recomputations of their spilled values.
    Remat,
    /// Delete any-hit payload stores the closest-hit shader overwrites.
    DeadPayloadStores,
    /// Block payload sinking when payload dependent control flow would be
    /// ambiguous after inlining.
    SinkingAmbiguity,
    /// Lay out the stack frames and lower every placeholder.
    Lower,
    /// Move payload stores behind the continuation signposts.
    SinkPayloadStores,
    /// Replace surviving payload markers with their operands.
    StripMarkers,
}

/// An any-hit shader and the closest-hit shader it commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HitGroup {
    pub any_hit: FuncRef,
    pub closest_hit: FuncRef,
}

/// What a pipeline run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub rematerialized: bool,
    pub dead_payload_stores: usize,
    pub sunk_payload_stores: usize,
    /// The continuation merge helper, if a returning shader needed one.
    pub merge_func: Option<FuncRef>,
}

pub struct RayTracingPipeline {
    ctx: RtContext,
    steps: Vec<Step>,
    hit_groups: Vec<HitGroup>,
}

impl RayTracingPipeline {
    /// Creates an empty pipeline.
    pub fn new(ctx: RtContext) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
            hit_groups: Vec::new(),
        }
    }

    /// The full lowering sequence:
    /// 1. `Remat`
    /// 2. `DeadPayloadStores`, on placeholder payloads
    /// 3. `SinkingAmbiguity`, before the lowering decides on signposts
    /// 4. `Lower`
    /// 5. `SinkPayloadStores`, once signposts know their payload offsets
    /// 6. `StripMarkers`
    pub fn default_pipeline(ctx: RtContext) -> Self {
        let mut pipeline = Self::new(ctx);
        for step in [
            Step::Remat,
            Step::DeadPayloadStores,
            Step::SinkingAmbiguity,
            Step::Lower,
            Step::SinkPayloadStores,
            Step::StripMarkers,
        ] {
            pipeline.add_step(step);
        }
        pipeline
    }

    pub fn add_step(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Registers a hit group for dead payload store elimination.
    pub fn add_hit_group(&mut self, any_hit: FuncRef, closest_hit: FuncRef) -> &mut Self {
        self.hit_groups.push(HitGroup {
            any_hit,
            closest_hit,
        });
        self
    }

    pub fn ctx(&self) -> &RtContext {
        &self.ctx
    }

    #[instrument(level = "debug", skip_all)]
    pub fn run(&mut self, module: &mut Module) -> LoweringResult<PipelineStats> {
        let mut stats = PipelineStats::default();
        for step in self.steps.clone() {
            debug!(?step, "running pipeline step");
            match step {
                Step::Remat => {
                    stats.rematerialized |= LateRemat::new(&self.ctx).run(module)?;
                }
                Step::DeadPayloadStores => {
                    for group in &self.hit_groups {
                        stats.dead_payload_stores +=
                            eliminate_dead_stores(module, group.any_hit, group.closest_hit);
                    }
                }
                Step::SinkingAmbiguity => {
                    check_sinking_ambiguity(module, &mut self.ctx);
                }
                Step::Lower => {
                    let mut lowering = IntrinsicLowering::new(&self.ctx);
                    lowering.run(module)?;
                    stats.merge_func = lowering.merge_func();
                }
                Step::SinkPayloadStores => {
                    stats.sunk_payload_stores += PayloadSinking::new(&self.ctx).run(module);
                }
                Step::StripMarkers => strip_markers(module),
            }
        }
        Ok(stats)
    }
}

//! Stack layout and spill/fill lowering for continuation based ray-tracing
//! shaders.
//!
//! The input module has already been split at every suspension point into a
//! root function and its continuations. [`RayTracingPipeline`] assigns every
//! shader group a software stack frame, rematerializes what it can, and
//! rewrites the ray-tracing placeholders into memory operations and
//! asynchronous dispatch primitives.
pub mod cfg_edit;
pub mod config;
pub mod context;
pub mod continuation;
pub mod domtree;
pub mod error;
pub mod late_remat;
pub mod lowering;
pub mod payload;
pub mod pipeline;
pub mod post_domtree;
pub mod report;
pub mod rt_builder;
pub mod rt_format;
pub mod stack_frame;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{LoweringConfig, TileShape};
pub use context::RtContext;
pub use error::{LoweringError, LoweringResult};
pub use pipeline::{HitGroup, PipelineStats, RayTracingPipeline, Step};
pub use report::FrameLayoutReport;

use thiserror::Error;

/// Internal invariant violations that abort the lowering of a module.
///
/// Gating failures of optional optimizations never surface here; the
/// component detecting them falls back to the unoptimized path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoweringError {
    #[error("root shader `{0}` has no shader metadata")]
    MissingShaderInfo(String),

    #[error(
        "fill at offset {offset} in `{func}` has no spill before the suspension point in `{caller}`"
    )]
    UnmatchedFill {
        func: String,
        caller: String,
        offset: u64,
    },

    #[error("{kind} in `{func}` was not registered with the stack frame layout")]
    UnregisteredHandle { func: String, kind: &'static str },

    #[error("frame of `{func}` needs {size} bytes but the shader group frame has {frame_size}")]
    FrameOverflow {
        func: String,
        size: u64,
        frame_size: u64,
    },

    #[error("spills at offsets {first} and {second} overlap in `{func}`")]
    OverlappingSpills { func: String, first: u64, second: u64 },

    #[error("fills at offsets {first} and {second} overlap in `{func}`")]
    OverlappingFills { func: String, first: u64, second: u64 },

    #[error("stack frame layout of `{0}` is used before it is finalized")]
    NotFinalized(String),

    #[error("stack frame layout of `{0}` is already finalized")]
    AlreadyFinalized(String),
}

pub type LoweringResult<T> = Result<T, LoweringError>;

/// Knobs of the continuation lowering.
///
/// The defaults describe a separately compiled shader with every
/// optimization enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringConfig {
    /// Keep fills and spills in their original order when shrink-wrapping.
    pub disable_spill_reorder: bool,
    /// Lay out every spill of a function in one struct instead of one per
    /// block.
    pub disable_compaction: bool,
    /// Sort fills by descending size before assigning their offsets.
    pub sort_fills_by_size: bool,
    /// Tiled mapping from lanes to dispatch indices in raygen shaders.
    pub custom_tiling: Option<TileShape>,

    pub payload_sinking: bool,
    /// Every shader of the pipeline is visible to the compiler.
    pub whole_program: bool,
    /// Resume continuations through bindless thread dispatch instead of a
    /// switch over continuation IDs.
    pub indirect_continuations: bool,
    pub max_trace_recursion_depth: u32,
    /// Skip the resume address write when a continuation invokes itself.
    pub rt_stack_opts: bool,
    /// Record live spill sizes on suspension points and pad the frame up to
    /// its boundary.
    pub pad_spills: bool,

    /// Guard raygen shaders against lanes outside the dispatch dimensions.
    pub dispatch_bounds_check: bool,
    /// Record frame layout entries for shader dumps.
    pub emit_layout_entries: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            disable_spill_reorder: false,
            disable_compaction: false,
            sort_fills_by_size: true,
            custom_tiling: None,
            payload_sinking: true,
            whole_program: false,
            indirect_continuations: true,
            max_trace_recursion_depth: 31,
            rt_stack_opts: true,
            pad_spills: false,
            dispatch_bounds_check: true,
            emit_layout_entries: false,
        }
    }
}

/// Shape of a dispatch tile in lanes, as log2 of its width and height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    pub log2_width: u32,
    pub log2_height: u32,
}

impl TileShape {
    pub fn width(self) -> u32 {
        1 << self.log2_width
    }

    pub fn height(self) -> u32 {
        1 << self.log2_height
    }
}

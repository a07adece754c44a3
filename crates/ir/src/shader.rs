//! Ray-tracing metadata attached to shader functions.
use std::fmt;

use crate::module::FuncRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    RayGen,
    ClosestHit,
    AnyHit,
    Miss,
    Callable,
    Intersection,
}

impl ShaderKind {
    /// Returns `true` if the shader resumes its caller's continuation when
    /// it returns.
    pub fn returns_to_continuation(self) -> bool {
        matches!(self, Self::ClosestHit | Self::Miss | Self::Callable)
    }

    pub fn has_caller(self) -> bool {
        !matches!(self, Self::RayGen)
    }
}

impl fmt::Display for ShaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RayGen => "raygeneration",
            Self::ClosestHit => "closesthit",
            Self::AnyHit => "anyhit",
            Self::Miss => "miss",
            Self::Callable => "callable",
            Self::Intersection => "intersection",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HitGroupKind {
    #[default]
    Triangles,
    Procedural,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderInfo {
    pub kind: ShaderKind,
    /// The function is a kernel entry point.
    pub is_kernel: bool,
    pub is_continuation: bool,
    pub hit_group: HitGroupKind,
    /// Size of the custom attributes of a procedural hit in bytes.
    pub hit_attribute_bytes: u32,
    /// Root function a continuation was split from.
    pub parent: Option<FuncRef>,
    /// Size of the stack frame of the shader group in bytes.
    pub stack_size: u64,
    /// Shader-identifier slot a continuation was promoted to.
    pub slot_num: Option<u32>,
    /// Frame layout records of a root, for shader dumps.
    pub frame_entries: Vec<FrameEntry>,
}

impl ShaderInfo {
    pub fn new(kind: ShaderKind) -> Self {
        Self {
            kind,
            is_kernel: false,
            is_continuation: false,
            hit_group: HitGroupKind::default(),
            hit_attribute_bytes: 0,
            parent: None,
            stack_size: 0,
            slot_num: None,
            frame_entries: Vec::new(),
        }
    }

    pub fn root(kind: ShaderKind) -> Self {
        Self {
            is_kernel: matches!(kind, ShaderKind::RayGen),
            ..Self::new(kind)
        }
    }

    pub fn continuation(kind: ShaderKind, parent: FuncRef) -> Self {
        Self {
            is_continuation: true,
            parent: Some(parent),
            ..Self::new(kind)
        }
    }

    pub fn with_hit_group(mut self, hit_group: HitGroupKind, attribute_bytes: u32) -> Self {
        self.hit_group = hit_group;
        self.hit_attribute_bytes = attribute_bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEntryKind {
    ReturnIp,
    Argument,
    Alloca,
    SpillUnion,
}

impl fmt::Display for FrameEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReturnIp => "return_ip",
            Self::Argument => "argument",
            Self::Alloca => "alloca",
            Self::SpillUnion => "spill_union",
        };
        write!(f, "{name}")
    }
}

/// One record of a frame layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEntry {
    pub kind: FrameEntryKind,
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub ty: String,
}

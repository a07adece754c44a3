use std::fmt::{Display, Formatter};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTriple {
    pub architecture: Architecture,
    pub platform: Platform,
    pub abi: RtAbi,
}

impl TargetTriple {
    pub fn new(architecture: Architecture, platform: Platform, abi: RtAbi) -> Self {
        Self {
            architecture,
            platform,
            abi,
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidTriple> {
        let mut triple = s.split('-');

        let arch = Architecture::parse(triple.next().ok_or(InvalidTriple::InvalidFormat(s))?)?;
        let platform = Platform::parse(triple.next().ok_or(InvalidTriple::InvalidFormat(s))?)?;
        let abi = RtAbi::parse(
            platform,
            triple.next().ok_or(InvalidTriple::InvalidFormat(s))?,
        )?;

        if triple.next().is_none() {
            Ok(Self::new(arch, platform, abi))
        } else {
            Err(InvalidTriple::InvalidFormat(s))
        }
    }

    pub fn caps(&self) -> RtCaps {
        self.platform.caps()
    }
}

impl Display for TargetTriple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.architecture, self.platform, self.abi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Xe,
}

impl Architecture {
    fn parse(s: &str) -> Result<Self, InvalidTriple> {
        match s {
            "xe" => Ok(Self::Xe),
            _ => Err(InvalidTriple::ArchitectureNotSupported),
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xe => write!(f, "xe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Dg2,
    Mtl,
    Xe2,
}

impl Platform {
    fn parse(s: &str) -> Result<Self, InvalidTriple> {
        match s {
            "dg2" => Ok(Self::Dg2),
            "mtl" => Ok(Self::Mtl),
            "xe2" => Ok(Self::Xe2),
            _ => Err(InvalidTriple::PlatformNotSupported),
        }
    }

    /// Ray-tracing capabilities of the platform.
    pub fn caps(self) -> RtCaps {
        match self {
            Self::Dg2 | Self::Mtl => RtCaps {
                shader_identifier_slots: 4,
                raygen_first_open_slot: 1,
                stack_frame_align: 16,
                simd_width: 16,
                call_stack_handler_patching: false,
            },
            Self::Xe2 => RtCaps {
                shader_identifier_slots: 4,
                raygen_first_open_slot: 1,
                stack_frame_align: 16,
                simd_width: 16,
                call_stack_handler_patching: true,
            },
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dg2 => write!(f, "dg2"),
            Self::Mtl => write!(f, "mtl"),
            Self::Xe2 => write!(f, "xe2"),
        }
    }
}

/// The ray-tracing stack ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtAbi {
    /// Continuation based ray tracing through the asynchronous ray-tracing unit.
    Async,
}

impl RtAbi {
    fn parse(platform: Platform, s: &str) -> Result<Self, InvalidTriple> {
        match (platform, s) {
            (Platform::Dg2 | Platform::Mtl | Platform::Xe2, "async") => Ok(Self::Async),
            _ => Err(InvalidTriple::AbiNotSupported),
        }
    }
}

impl Display for RtAbi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
        }
    }
}

/// Hardware limits the continuation lowering has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtCaps {
    /// Number of 8-byte address slots in a shader identifier.
    pub shader_identifier_slots: u32,
    /// First slot of a raygen shader identifier that the compiler may claim.
    pub raygen_first_open_slot: u32,
    /// Alignment of every software stack frame in bytes.
    pub stack_frame_align: u32,
    pub simd_width: u32,
    pub call_stack_handler_patching: bool,
}

impl RtCaps {
    /// Number of identifier slots available to promoted continuations.
    pub fn open_raygen_slots(&self) -> u32 {
        self.shader_identifier_slots - self.raygen_first_open_slot
    }
}

#[derive(Debug, Clone, Copy, Error)]
pub enum InvalidTriple<'a> {
    #[error("the format of triple must be `architecture-platform-abi`: but got `{0}`")]
    InvalidFormat(&'a str),

    #[error("given architecture is not supported")]
    ArchitectureNotSupported,

    #[error("given platform is not supported")]
    PlatformNotSupported,

    #[error("given ray-tracing abi is not supported")]
    AbiNotSupported,
}

//! Byte layouts of the memory shared with the ray-tracing unit.

/// Software hot zone, one per lane.
pub mod hot_zone {
    /// Running offset of the software stack (`u32`).
    pub const STACK_OFFSET: i64 = 0;
    /// Dispatch ray index x, y and z (`u32` each).
    pub const DISPATCH_INDEX: i64 = 4;
}

/// Asynchronous-operation record of a lane.
pub mod async_stack {
    /// Committed hit information (`u32`).
    pub const COMMITTED_HIT_INFO: i64 = 12;
    /// Front-face bit inside [`COMMITTED_HIT_INFO`].
    pub const FRONT_FACE_BIT: i32 = 1 << 20;
    /// Barycentrics of the committed triangle hit (`f32` each).
    pub const COMMITTED_BARYCENTRICS: i64 = 16;

    /// Start of the ray record.
    pub const MEM_RAY: i64 = 64;
    /// origin.xyz, tmin, direction.xyz, tmax (`f32` each), relative to
    /// [`MEM_RAY`].
    pub const RAY_INFO: i64 = 0;
    /// Index of tmax in the ray info. The ray-tracing unit updates it while
    /// traversing, every other field is left untouched.
    pub const TMAX_INDEX: usize = 7;
    pub const ROOT_NODE: i64 = 32;
    pub const RAY_FLAGS: i64 = 40;
    pub const INSTANCE_MASK: i64 = 44;
    pub const HIT_GROUP_RECORD: i64 = 48;
    pub const GEOMETRY_STRIDE: i64 = 56;
    pub const MISS_RECORD: i64 = 64;

    pub fn ray_info_offset(index: usize) -> i64 {
        MEM_RAY + RAY_INFO + 4 * index as i64
    }
}

/// Dispatch globals shared by every lane of a dispatch.
pub mod dispatch_globals {
    /// Dispatch dimensions x, y and z (`u32` each).
    pub const DIMENSIONS: i64 = 0;
    pub const HIT_GROUP_BASE: i64 = 16;
    pub const HIT_GROUP_STRIDE: i64 = 24;
    pub const MISS_BASE: i64 = 32;
    pub const MISS_STRIDE: i64 = 40;
    pub const CALLABLE_BASE: i64 = 48;
    pub const CALLABLE_STRIDE: i64 = 56;
}

/// Argument region at the start of every non-raygen frame.
pub mod frame_args {
    /// Resume address of the caller (`u64`).
    pub const RETURN_IP: i64 = 0;
    /// Incoming payload pointer.
    pub const PAYLOAD: i64 = 8;
    /// Hit kind of a procedural hit (`u32`).
    pub const HIT_KIND: i64 = 16;
    /// Custom attributes of a procedural hit.
    pub const HIT_ATTRIBUTES: i64 = 20;
    /// Size of the region without procedural hit data.
    pub const BASE_SIZE: u64 = 16;
}

/// Hit kinds reported for triangle hits.
pub const HIT_KIND_TRIANGLE_FRONT_FACE: i32 = 0xFE;
pub const HIT_KIND_TRIANGLE_BACK_FACE: i32 = 0xFF;

/// Size of one shader identifier slot in bytes.
pub const SHADER_IDENTIFIER_SLOT_SIZE: i64 = 8;

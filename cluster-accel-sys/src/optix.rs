use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Size of one handle or device address entry in a handle/address table.
pub const HANDLE_STRIDE_IN_BYTES: u32 = 8;
/// Size of one per-argument size entry in a sizes table.
pub const SIZE_STRIDE_IN_BYTES: u32 = 4;

/// Required alignment of a cluster-level acceleration structure (CLAS).
pub const CLAS_BYTE_ALIGNMENT: u64 = 128;
/// Required alignment of a cluster template.
pub const CLUSTER_TEMPLATE_BYTE_ALIGNMENT: u64 = 32;
/// Required alignment of a bottom-level acceleration structure.
pub const ACCEL_BUFFER_BYTE_ALIGNMENT: u64 = 256;

/// Largest triangle count a single cluster may hold.
pub const MAX_TRIANGLES_PER_CLUSTER: u32 = 256;
/// Largest vertex count a single cluster may reference.
pub const MAX_VERTICES_PER_CLUSTER: u32 = 256;
/// Largest meaningful position truncation (bits dropped from each `f32`).
pub const MAX_POSITION_TRUNCATE_BIT_COUNT: u32 = 32;

/// `OPTIX_CLUSTER_ACCEL_CLUSTER_FLAG_NONE`.
pub const CLUSTER_FLAG_NONE: u32 = 0;
/// `OPTIX_CLUSTER_ACCEL_CLUSTER_FLAG_ALLOW_DISABLE_OPACITY_MICROMAPS`.
pub const CLUSTER_FLAG_ALLOW_DISABLE_OPACITY_MICROMAPS: u32 = 1 << 0;

/// `OPTIX_CLUSTER_ACCEL_PRIMITIVE_FLAG_NONE`.
pub const PRIMITIVE_FLAG_NONE: u32 = 0;
/// `OPTIX_CLUSTER_ACCEL_PRIMITIVE_FLAG_DISABLE_TRIANGLE_FACE_CULLING`.
pub const PRIMITIVE_FLAG_DISABLE_TRIANGLE_FACE_CULLING: u32 = 1 << 0;
/// `OPTIX_CLUSTER_ACCEL_PRIMITIVE_FLAG_REQUIRE_SINGLE_ANYHIT_CALL`.
pub const PRIMITIVE_FLAG_REQUIRE_SINGLE_ANYHIT_CALL: u32 = 1 << 1;
/// `OPTIX_CLUSTER_ACCEL_PRIMITIVE_FLAG_DISABLE_ANYHIT`.
pub const PRIMITIVE_FLAG_DISABLE_ANYHIT: u32 = 1 << 2;

/// Index element format of a cluster's index buffer.
///
/// The discriminant is the element size in bytes, as in
/// `OptixClusterAccelIndicesFormat`.
#[repr(u32)]
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
pub enum IndicesFormat {
    #[display("8-bit")]
    Bits8 = 1,
    #[display("16-bit")]
    Bits16 = 2,
    #[display("32-bit")]
    Bits32 = 4,
}

impl IndicesFormat {
    /// Size of one index element in bytes.
    #[inline]
    pub fn element_size(self) -> u32 {
        self as u32
    }
}

/// A contiguous bit range inside a packed `u32` word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitField {
    pub shift: u32,
    pub width: u32,
}

impl BitField {
    pub const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    /// Largest value the field can hold.
    #[inline]
    pub const fn max_value(self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        self.max_value() << self.shift
    }
}

// Word at offset 8 of the triangles record.
pub const TRIANGLE_COUNT_BITS: BitField = BitField::new(0, 9);
pub const VERTEX_COUNT_BITS: BitField = BitField::new(9, 9);
pub const POSITION_TRUNCATE_BIT_COUNT_BITS: BitField = BitField::new(18, 6);
pub const INDEX_FORMAT_BITS: BitField = BitField::new(24, 4);
pub const OPACITY_MICROMAP_INDEX_FORMAT_BITS: BitField = BitField::new(28, 4);

// `OptixClusterAccelPrimitiveInfo`.
pub const SBT_INDEX_BITS: BitField = BitField::new(0, 24);
pub const PRIMITIVE_INFO_RESERVED_BITS: BitField = BitField::new(24, 5);
pub const PRIMITIVE_FLAGS_BITS: BitField = BitField::new(29, 3);

/// `OptixClusterAccelBuildInputTrianglesArgs`.
///
/// Consumed by `clas_from_triangles` and `templates_from_triangles`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClusterAccelBuildInputTrianglesArgs {
    pub cluster_id: u32,
    pub cluster_flags: u32,
    /// See [`TRIANGLE_COUNT_BITS`] through
    /// [`OPACITY_MICROMAP_INDEX_FORMAT_BITS`].
    pub packed_counts: u32,
    /// See [`SBT_INDEX_BITS`] and [`PRIMITIVE_FLAGS_BITS`].
    pub base_primitive_info: u32,
    pub index_buffer_stride_in_bytes: u16,
    pub vertex_buffer_stride_in_bytes: u16,
    pub primitive_info_buffer_stride_in_bytes: u16,
    pub opacity_micromap_index_buffer_stride_in_bytes: u16,
    pub index_buffer: u64,
    pub vertex_buffer: u64,
    pub primitive_info_buffer: u64,
    pub opacity_micromap_array: u64,
    pub opacity_micromap_index_buffer: u64,
    pub instantiation_bounding_box_limit: u64,
}

/// `OptixClusterAccelBuildInputTemplatesArgs`.
///
/// Consumed by `clas_from_templates`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClusterAccelBuildInputTemplatesArgs {
    pub cluster_id_offset: u32,
    pub sbt_index_offset: u32,
    pub cluster_template: u64,
    pub vertex_buffer: u64,
    pub vertex_stride_in_bytes: u32,
    pub reserved: u32,
}

/// `OptixClusterAccelBuildInputClustersArgs`.
///
/// Consumed by `blas_from_clas`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClusterAccelBuildInputClustersArgs {
    pub cluster_handles_count: u32,
    pub cluster_handles_buffer_stride_in_bytes: u32,
    pub cluster_handles_buffer: u64,
}

const _: () = assert!(std::mem::size_of::<ClusterAccelBuildInputTrianglesArgs>() == 72);
const _: () = assert!(std::mem::size_of::<ClusterAccelBuildInputTemplatesArgs>() == 32);
const _: () = assert!(std::mem::size_of::<ClusterAccelBuildInputClustersArgs>() == 16);

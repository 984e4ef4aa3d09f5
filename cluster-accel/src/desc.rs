//! # Build Descriptors
//!
//! A [`ClusterAccelBuildDesc`] describes one build invocation: which
//! operation, where its argument records live, the limits that bound every
//! argument, and where the results go ([`BuildMode`]).
//!
//! The operation and its limits are set together by the per-operation
//! constructors, so a descriptor cannot pair `blas_from_clas` with triangle
//! limits. Descriptors coming from a wire representation go through
//! [`ClusterAccelBuildDesc::from_raw()`] instead, which rejects unknown
//! operations and mismatched limits.
//!
//! In every buffer field of the mode parameters, [`DeviceAddress::NULL`]
//! means "not supplied", a stride of 0 means the tightly packed default (8
//! bytes for handles and addresses, 4 bytes for sizes) and a
//! `*_size_in_bytes` of 0 means "up to the end of the buffer containing the
//! address".
use crate::abi::{ArgsRecord, ClustersArgs, TemplatesArgs, TrianglesArgs};
use crate::validate::ValidationError;
use crate::DeviceAddress;
use cluster_accel_sys as sys;
use derive_more::{Display, From};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The cluster acceleration structure operations.
#[repr(u32)]
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
pub enum ClusterAccelBuildOp {
    /// Build CLAS from triangle clusters ([`TrianglesArgs`]).
    #[display("clas_from_triangles")]
    ClasFromTriangles = 0,
    /// Build BLAS from lists of CLAS handles ([`ClustersArgs`]).
    #[display("blas_from_clas")]
    BlasFromClas = 1,
    /// Build cluster templates from triangle clusters ([`TrianglesArgs`]).
    #[display("templates_from_triangles")]
    TemplatesFromTriangles = 2,
    /// Instantiate CLAS from templates ([`TemplatesArgs`]).
    #[display("clas_from_templates")]
    ClasFromTemplates = 3,
}

impl ClusterAccelBuildOp {
    pub const ALL: [Self; 4] = [
        Self::ClasFromTriangles,
        Self::BlasFromClas,
        Self::TemplatesFromTriangles,
        Self::ClasFromTemplates,
    ];

    /// Converts a raw operation value, rejecting anything outside `0..=3`.
    pub fn from_raw(raw: u32) -> Result<Self, ValidationError> {
        Self::try_from(raw).map_err(|_| ValidationError::UnknownOp(raw))
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.into()
    }

    /// Size of the argument record this operation consumes, i.e. the
    /// smallest valid argument stride.
    pub fn args_record_size(self) -> u32 {
        match self {
            Self::ClasFromTriangles | Self::TemplatesFromTriangles => TrianglesArgs::SIZE,
            Self::ClasFromTemplates => TemplatesArgs::SIZE,
            Self::BlasFromClas => ClustersArgs::SIZE,
        }
    }

    /// The limits family this operation is bounded by.
    ///
    /// `clas_from_templates` uses triangle limits: the native APIs size an
    /// instantiation by the largest template it may come from.
    pub fn limits_family(self) -> LimitsFamily {
        match self {
            Self::BlasFromClas => LimitsFamily::Clusters,
            _ => LimitsFamily::Triangles,
        }
    }

    /// Alignment of each structure this operation produces.
    pub fn structure_alignment(self) -> u64 {
        match self {
            Self::ClasFromTriangles | Self::ClasFromTemplates => sys::CLAS_BYTE_ALIGNMENT,
            Self::TemplatesFromTriangles => sys::CLUSTER_TEMPLATE_BYTE_ALIGNMENT,
            Self::BlasFromClas => sys::ACCEL_BUFFER_BYTE_ALIGNMENT,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum LimitsFamily {
    #[display("triangle")]
    Triangles,
    #[display("cluster")]
    Clusters,
}

/// Upper bounds for the triangle based operations.
///
/// All fields but `position_truncate_bit_count` must be nonzero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LimitsTriangles {
    pub max_arg_count: u32,
    pub max_triangle_count_per_arg: u32,
    pub max_vertex_count_per_arg: u32,
    pub max_unique_sbt_index_count_per_arg: u32,
    pub position_truncate_bit_count: u32,
}

/// Upper bounds for `blas_from_clas`. All fields must be nonzero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LimitsClusters {
    pub max_arg_count: u32,
    pub max_total_cluster_count: u32,
    pub max_cluster_count_per_arg: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From)]
pub enum Limits {
    Triangles(LimitsTriangles),
    Clusters(LimitsClusters),
}

impl Limits {
    pub fn family(&self) -> LimitsFamily {
        match self {
            Limits::Triangles(_) => LimitsFamily::Triangles,
            Limits::Clusters(_) => LimitsFamily::Clusters,
        }
    }

    pub fn max_arg_count(&self) -> u32 {
        match self {
            Limits::Triangles(limits) => limits.max_arg_count,
            Limits::Clusters(limits) => limits.max_arg_count,
        }
    }
}

/// Parameters of an implicit build: the backend places the structures inside
/// `output_buffer` itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImplicitBuildParams {
    pub output_buffer: DeviceAddress,
    pub output_buffer_size_in_bytes: u64,
    pub temp_buffer: DeviceAddress,
    pub temp_buffer_size_in_bytes: u64,
    pub output_handles_buffer: DeviceAddress,
    pub output_handles_stride_in_bytes: u32,
    /// Optional.
    pub output_sizes_buffer: DeviceAddress,
    pub output_sizes_stride_in_bytes: u32,
}

/// Parameters of an explicit-destinations build: each structure goes to the
/// address read from `dest_addresses_buffer` for its argument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExplicitDestinationsParams {
    pub temp_buffer: DeviceAddress,
    pub temp_buffer_size_in_bytes: u64,
    pub dest_addresses_buffer: DeviceAddress,
    pub dest_addresses_stride_in_bytes: u32,
    /// Optional. Without it, handles are written back over the destination
    /// table.
    pub output_handles_buffer: DeviceAddress,
    pub output_handles_stride_in_bytes: u32,
    /// Optional.
    pub output_sizes_buffer: DeviceAddress,
    pub output_sizes_stride_in_bytes: u32,
}

/// Parameters of a get-sizes build: only the exact per-argument sizes are
/// written, nothing is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetSizesParams {
    pub temp_buffer: DeviceAddress,
    pub temp_buffer_size_in_bytes: u64,
    pub output_sizes_buffer: DeviceAddress,
    pub output_sizes_stride_in_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, From)]
pub enum BuildMode {
    #[display("implicit")]
    Implicit(ImplicitBuildParams),
    #[display("explicit_destinations")]
    ExplicitDestinations(ExplicitDestinationsParams),
    #[display("get_sizes")]
    GetSizes(GetSizesParams),
}

impl Default for BuildMode {
    fn default() -> Self {
        BuildMode::Implicit(ImplicitBuildParams::default())
    }
}

impl BuildMode {
    pub fn temp_buffer(&self) -> DeviceAddress {
        match self {
            BuildMode::Implicit(p) => p.temp_buffer,
            BuildMode::ExplicitDestinations(p) => p.temp_buffer,
            BuildMode::GetSizes(p) => p.temp_buffer,
        }
    }
}

/// Describes one cluster acceleration structure build.
///
/// ```
/// use cluster_accel::{BuildMode, ClusterAccelBuildDesc, ClusterAccelBuildOp, GetSizesParams};
/// use cluster_accel::{DeviceAddress, LimitsClusters};
///
/// let desc = ClusterAccelBuildDesc::blas_from_clas(LimitsClusters {
///     max_arg_count: 1,
///     max_total_cluster_count: 2,
///     max_cluster_count_per_arg: 2,
/// })
/// .with_args(DeviceAddress::new(0x1000), 16, 1)
/// .with_mode(BuildMode::GetSizes(GetSizesParams {
///     temp_buffer: DeviceAddress::new(0x2000),
///     output_sizes_buffer: DeviceAddress::new(0x3000),
///     ..Default::default()
/// }));
///
/// assert_eq!(desc.op(), ClusterAccelBuildOp::BlasFromClas);
/// assert!(cluster_accel::validate(&desc).is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterAccelBuildDesc {
    op: ClusterAccelBuildOp,
    limits: Limits,
    pub args_buffer: DeviceAddress,
    pub args_stride_in_bytes: u32,
    pub arg_count: u32,
    pub mode: BuildMode,
}

impl ClusterAccelBuildDesc {
    fn with_op(op: ClusterAccelBuildOp, limits: Limits) -> Self {
        Self {
            op,
            limits,
            args_buffer: DeviceAddress::NULL,
            args_stride_in_bytes: 0,
            arg_count: 0,
            mode: BuildMode::default(),
        }
    }

    pub fn clas_from_triangles(limits: LimitsTriangles) -> Self {
        Self::with_op(ClusterAccelBuildOp::ClasFromTriangles, limits.into())
    }

    pub fn templates_from_triangles(limits: LimitsTriangles) -> Self {
        Self::with_op(ClusterAccelBuildOp::TemplatesFromTriangles, limits.into())
    }

    /// Instantiation is bounded by the triangle limits of the templates it
    /// reads from.
    pub fn clas_from_templates(limits: LimitsTriangles) -> Self {
        Self::with_op(ClusterAccelBuildOp::ClasFromTemplates, limits.into())
    }

    pub fn blas_from_clas(limits: LimitsClusters) -> Self {
        Self::with_op(ClusterAccelBuildOp::BlasFromClas, limits.into())
    }

    /// Builds a descriptor from a raw operation value.
    ///
    /// Fails if `op` is unknown or `limits` belongs to the other family.
    pub fn from_raw(op: u32, limits: Limits) -> Result<Self, ValidationError> {
        let op = ClusterAccelBuildOp::from_raw(op)?;
        if op.limits_family() != limits.family() {
            return Err(ValidationError::LimitsFamilyMismatch {
                op,
                expected: op.limits_family(),
                actual: limits.family(),
            });
        }
        Ok(Self::with_op(op, limits))
    }

    /// Sets the argument buffer, the distance between records and the
    /// number of records.
    pub fn with_args(
        mut self,
        args_buffer: DeviceAddress,
        stride_in_bytes: u32,
        count: u32,
    ) -> Self {
        self.args_buffer = args_buffer;
        self.args_stride_in_bytes = stride_in_bytes;
        self.arg_count = count;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<BuildMode>) -> Self {
        self.mode = mode.into();
        self
    }

    #[inline]
    pub fn op(&self) -> ClusterAccelBuildOp {
        self.op
    }

    #[inline]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// The triangle limits, if this is a triangle based operation.
    pub fn limits_triangles(&self) -> Option<&LimitsTriangles> {
        match &self.limits {
            Limits::Triangles(limits) => Some(limits),
            Limits::Clusters(_) => None,
        }
    }

    pub fn limits_clusters(&self) -> Option<&LimitsClusters> {
        match &self.limits {
            Limits::Clusters(limits) => Some(limits),
            Limits::Triangles(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_raw_values_are_stable() {
        assert_eq!(ClusterAccelBuildOp::ClasFromTriangles.raw(), 0);
        assert_eq!(ClusterAccelBuildOp::BlasFromClas.raw(), 1);
        assert_eq!(ClusterAccelBuildOp::TemplatesFromTriangles.raw(), 2);
        assert_eq!(ClusterAccelBuildOp::ClasFromTemplates.raw(), 3);
        assert_eq!(
            ClusterAccelBuildOp::from_raw(4),
            Err(ValidationError::UnknownOp(4))
        );
    }

    #[test]
    fn record_sizes_per_op() {
        assert_eq!(ClusterAccelBuildOp::ClasFromTriangles.args_record_size(), 72);
        assert_eq!(ClusterAccelBuildOp::TemplatesFromTriangles.args_record_size(), 72);
        assert_eq!(ClusterAccelBuildOp::ClasFromTemplates.args_record_size(), 32);
        assert_eq!(ClusterAccelBuildOp::BlasFromClas.args_record_size(), 16);
    }

    #[test]
    fn from_raw_rejects_mismatched_limits() {
        let err = ClusterAccelBuildDesc::from_raw(1, LimitsTriangles::default().into());
        assert!(matches!(
            err,
            Err(ValidationError::LimitsFamilyMismatch {
                op: ClusterAccelBuildOp::BlasFromClas,
                ..
            })
        ));

        let desc = ClusterAccelBuildDesc::from_raw(3, LimitsTriangles::default().into()).unwrap();
        assert_eq!(desc.op(), ClusterAccelBuildOp::ClasFromTemplates);
        assert!(desc.limits_triangles().is_some());
    }
}

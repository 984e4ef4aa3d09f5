#![cfg_attr(docsrs, feature(doc_auto_cfg))]
//! # Cluster Acceleration Structure Builds
//!
//! Backend-agnostic descriptors and build orchestration for ray-tracing
//! *clusters*: small, independently built cluster-level acceleration
//! structures (CLAS) that are later assembled into bottom-level acceleration
//! structures (BLAS), as exposed by the *OptiX* cluster acceleration API and
//! its equivalents.
//!
//! A build goes through three stages:
//!
//! 1. **Declared** – fill argument records ([`abi`]) into a device buffer and
//!    describe the build with a [`ClusterAccelBuildDesc`].
//! 2. **Sized** – ask the backend for the memory the build needs with
//!    [`Device::get_cluster_acceleration_structure_sizes()`].
//! 3. **Built** – allocate result/scratch memory and record the build with
//!    [`CommandEncoder::build_cluster_acceleration_structure()`] (or its packed
//!    `_into` form), then submit and wait.
//!
//! ## Two error channels
//!
//! Structural problems (a malformed descriptor, limits the backend cannot
//! satisfy, undersized buffers) are returned as [`Error`] from the call that
//! detects them, before anything reaches the device.
//!
//! A build that runs but fails on the device for one argument is *not* an
//! error: the backend writes a zero [`Handle`] for that argument. Handles are
//! only meaningful after the command buffer completed ([`Device::wait()`]);
//! check them with [`Device::read_handles()`] and [`HandleReport`].
//!
//! ## Ordering
//!
//! When argument records are written in the same command stream that builds
//! from them ([`CommandEncoder::write_buffer()`], or a compute kernel on a
//! native backend), the caller records a barrier between the write and the
//! build. The encoder never inserts one.
//!
//! ## Example
//!
//! ```
//! use cluster_accel::abi::{ArgsRecord, IndicesFormat, TrianglesArgs};
//! use cluster_accel::*;
//!
//! # fn main() -> cluster_accel::Result<()> {
//! let device = Device::new(DeviceOptions::default())?;
//!
//! let vertices: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
//! let indices: [u32; 3] = [0, 1, 2];
//! let vertex_buffer = device.create_buffer(BufferDesc::with_data(
//!     "vertices",
//!     BufferUsage::BUILD_INPUT,
//!     bytemuck::cast_slice(&vertices),
//! ))?;
//! let index_buffer = device.create_buffer(BufferDesc::with_data(
//!     "indices",
//!     BufferUsage::BUILD_INPUT,
//!     bytemuck::cast_slice(&indices),
//! ))?;
//!
//! let args = TrianglesArgs::new(
//!     0,
//!     1,
//!     3,
//!     index_buffer.device_address(),
//!     vertex_buffer.device_address(),
//!     12,
//!     IndicesFormat::Bits32,
//! );
//! let args_buffer = device.create_buffer(BufferDesc::with_data(
//!     "args",
//!     BufferUsage::BUILD_INPUT,
//!     &args.to_bytes()?,
//! ))?;
//!
//! let desc = ClusterAccelBuildDesc::clas_from_triangles(LimitsTriangles {
//!     max_arg_count: 1,
//!     max_triangle_count_per_arg: 1,
//!     max_vertex_count_per_arg: 3,
//!     max_unique_sbt_index_count_per_arg: 1,
//!     position_truncate_bit_count: 0,
//! })
//! .with_args(args_buffer.device_address(), TrianglesArgs::SIZE, 1);
//!
//! let sizes = device.get_cluster_acceleration_structure_sizes(&desc)?;
//! let result = device.create_buffer(BufferDesc::new(
//!     "clas",
//!     BufferUsage::ACCELERATION_STRUCTURE,
//!     sizes.result_size,
//! ))?;
//! let scratch = device.create_buffer(BufferDesc::new(
//!     "scratch",
//!     BufferUsage::ACCELERATION_STRUCTURE,
//!     sizes.scratch_size,
//! ))?;
//!
//! let mut encoder = device.create_command_encoder();
//! encoder.build_cluster_acceleration_structure_into(
//!     &desc,
//!     BufferOffsetPair::from(&scratch),
//!     BufferOffsetPair::from(&result),
//! )?;
//! device.submit_command_buffer(encoder.finish());
//! device.wait()?;
//!
//! let report = device.read_handles(&result, 0, 1)?;
//! assert!(report.all_built());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
#![doc = document_features::document_features!()]

pub mod abi;
pub mod backend;
pub mod command;
pub mod desc;
pub mod device;
pub mod error;
pub mod handles;
pub mod sizes;
pub mod validate;

pub use backend::{ClusterAccelBackend, SoftwareBackendOptions, StructureInfo, StructureKind};
pub use command::{CommandBuffer, CommandEncoder, Hazard};
pub use desc::*;
pub use device::{
    Buffer, BufferDesc, BufferOffsetPair, BufferUsage, Device, DeviceBackend, DeviceOptions,
    Feature,
};
pub use error::{Error, Result};
pub use handles::HandleReport;
pub use sizes::{ClusterAccelSizes, SizeCache};
pub use validate::{validate, validate_for_sizing, ValidationError, ValidationRule};

use derive_more::{Display, From, Into};

/// A raw 64-bit device address.
///
/// Addresses carry no ownership: the memory belongs to whichever buffer
/// produced the address, and the address dangles once that buffer is gone.
/// There are no arithmetic operators; use [`offset()`](Self::offset).
///
/// # Examples
///
/// ```
/// use cluster_accel::DeviceAddress;
///
/// let base = DeviceAddress::new(0x1000);
/// assert_eq!(base.offset(0x20), Some(DeviceAddress::new(0x1020)));
/// assert!(DeviceAddress::NULL.is_null());
/// assert_eq!(u64::from(base), 0x1000);
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into,
)]
#[display("{_0:#x}")]
#[repr(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// The null address. Marks an absent buffer.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        0 == self.0
    }

    /// Returns the address `bytes` past this one, or `None` on overflow.
    #[inline]
    pub fn offset(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Opaque handle to a built cluster, template or BLAS, as written by the
/// backend into a handles buffer.
///
/// Zero means the structure was not produced (the build failed for that
/// argument). Any other value is backend-defined and only good for
/// referencing the structure in a later build or trace. Handles do not own
/// memory; they stay valid while the result buffer they point into lives.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into,
)]
#[display("{_0:#018x}")]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The "not produced" handle.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` if the backend produced a structure.
    #[inline]
    pub const fn is_valid(self) -> bool {
        0 != self.0
    }

    /// Device address of the structure this handle refers to.
    ///
    /// Every backend this crate targets uses the structure's address as its
    /// handle.
    #[inline]
    pub const fn address(self) -> DeviceAddress {
        DeviceAddress(self.0)
    }
}

impl From<DeviceAddress> for Handle {
    #[inline]
    fn from(address: DeviceAddress) -> Self {
        Handle(address.0)
    }
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

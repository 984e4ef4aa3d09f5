//! # Backends
//!
//! A backend turns a validated, resolved [`BuildCommand`] into structures in
//! device memory. It sees device memory only through [`DeviceMemory`], so the
//! same backend runs against the reference [`Device`](crate::Device) heap or
//! against any other memory that can be read and written by address.
//!
//! [`SoftwareBackend`] implements the contract on the host, following the
//! *OptiX* argument-record ABI bit for bit.
use crate::desc::{
    BuildMode, ClusterAccelBuildDesc, ClusterAccelBuildOp, ExplicitDestinationsParams,
    GetSizesParams, ImplicitBuildParams, Limits,
};
use crate::error::{Error, Result};
use crate::sizes::ClusterAccelSizes;
use crate::{DeviceAddress, Handle};
use cluster_accel_sys as sys;
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

pub mod software;

pub use software::{SoftwareBackend, SoftwareBackendOptions};

/// Device memory as seen by a backend.
pub trait DeviceMemory: Send + Sync {
    /// Fills `dst` from `address`. The whole range must lie in one buffer.
    fn read(&self, address: DeviceAddress, dst: &mut [u8]) -> Result<()>;

    /// Copies `src` to `address`. The whole range must lie in one buffer.
    fn write(&mut self, address: DeviceAddress, src: &[u8]) -> Result<()>;

    /// Bytes from `address` to the end of the buffer containing it.
    fn extent(&self, address: DeviceAddress) -> Option<u64>;

    fn read_u64(&self, address: DeviceAddress) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Reads `len` bytes from `address`. Nothing is allocated unless the
    /// range lies inside one buffer.
    fn read_vec(&self, address: DeviceAddress, len: u64) -> Result<Vec<u8>> {
        let out_of_bounds = || Error::AddressOutOfBounds { address, len };
        if 0 == len {
            return Ok(Vec::new());
        }
        if self.extent(address).is_none_or(|extent| extent < len) {
            return Err(out_of_bounds());
        }
        let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
        let mut bytes = vec![0u8; len];
        self.read(address, &mut bytes)?;
        Ok(bytes)
    }
}

/// What a backend is able to build. Limits beyond these fail sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub max_triangles_per_cluster: u32,
    pub max_vertices_per_cluster: u32,
    pub max_position_truncate_bit_count: u32,
    pub max_clusters_per_blas: u32,
    /// Largest result or scratch allocation the backend accepts.
    pub max_structure_bytes: u64,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            max_triangles_per_cluster: sys::MAX_TRIANGLES_PER_CLUSTER,
            max_vertices_per_cluster: sys::MAX_VERTICES_PER_CLUSTER,
            max_position_truncate_bit_count: sys::MAX_POSITION_TRUNCATE_BIT_COUNT,
            max_clusters_per_blas: 1 << 24,
            max_structure_bytes: 1 << 40,
        }
    }
}

#[repr(u32)]
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
pub enum StructureKind {
    #[display("CLAS")]
    Cluster = 1,
    #[display("cluster template")]
    Template = 2,
    #[display("BLAS")]
    Blas = 3,
}

/// Metadata of a built structure, for backends that can report it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StructureInfo {
    pub kind: StructureKind,
    /// Zero for a BLAS.
    pub cluster_id: u32,
    /// Triangles of a CLAS or template, clusters of a BLAS.
    pub primitive_count: u32,
    pub vertex_count: u32,
    pub size_in_bytes: u64,
    /// `[min, max]`; all zero for a template built without positions.
    pub bounds: [[f32; 3]; 2],
}

/// A build as handed to a backend: validated, with every default stride and
/// buffer size resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildCommand {
    pub op: ClusterAccelBuildOp,
    pub limits: Limits,
    pub args_buffer: DeviceAddress,
    pub args_stride_in_bytes: u64,
    pub arg_count: u32,
    pub mode: BuildMode,
}

fn or_default(stride: u32, default: u32) -> u32 {
    if 0 == stride {
        default
    } else {
        stride
    }
}

impl BuildCommand {
    /// Resolves `desc` against `memory`: zero strides become their defaults
    /// and zero buffer sizes become the remaining extent of the buffer.
    pub fn resolve(desc: &ClusterAccelBuildDesc, memory: &dyn DeviceMemory) -> Result<Self> {
        let extent = |address: DeviceAddress, size: u64, field: &str| -> Result<u64> {
            if 0 != size {
                return Ok(size);
            }
            memory.extent(address).ok_or_else(|| {
                Error::BuildCommandInvalid(format!(
                    "`{field}` {address} does not point into a live buffer"
                ))
            })
        };

        let handle = sys::HANDLE_STRIDE_IN_BYTES;
        let size = sys::SIZE_STRIDE_IN_BYTES;
        let mode = match desc.mode {
            BuildMode::Implicit(p) => BuildMode::Implicit(ImplicitBuildParams {
                output_buffer_size_in_bytes: extent(
                    p.output_buffer,
                    p.output_buffer_size_in_bytes,
                    "output_buffer",
                )?,
                temp_buffer_size_in_bytes: extent(
                    p.temp_buffer,
                    p.temp_buffer_size_in_bytes,
                    "temp_buffer",
                )?,
                output_handles_stride_in_bytes: or_default(
                    p.output_handles_stride_in_bytes,
                    handle,
                ),
                output_sizes_stride_in_bytes: or_default(p.output_sizes_stride_in_bytes, size),
                ..p
            }),
            BuildMode::ExplicitDestinations(p) => {
                BuildMode::ExplicitDestinations(ExplicitDestinationsParams {
                    temp_buffer_size_in_bytes: extent(
                        p.temp_buffer,
                        p.temp_buffer_size_in_bytes,
                        "temp_buffer",
                    )?,
                    dest_addresses_stride_in_bytes: or_default(
                        p.dest_addresses_stride_in_bytes,
                        handle,
                    ),
                    output_handles_stride_in_bytes: or_default(
                        p.output_handles_stride_in_bytes,
                        handle,
                    ),
                    output_sizes_stride_in_bytes: or_default(p.output_sizes_stride_in_bytes, size),
                    ..p
                })
            }
            BuildMode::GetSizes(p) => BuildMode::GetSizes(GetSizesParams {
                temp_buffer_size_in_bytes: extent(
                    p.temp_buffer,
                    p.temp_buffer_size_in_bytes,
                    "temp_buffer",
                )?,
                output_sizes_stride_in_bytes: or_default(p.output_sizes_stride_in_bytes, size),
                ..p
            }),
        };

        Ok(Self {
            op: desc.op(),
            limits: *desc.limits(),
            args_buffer: desc.args_buffer,
            args_stride_in_bytes: desc.args_stride_in_bytes.into(),
            arg_count: desc.arg_count,
            mode,
        })
    }

    /// Address of argument record `index`.
    pub fn arg_address(&self, index: u32) -> Option<DeviceAddress> {
        self.args_stride_in_bytes
            .checked_mul(index.into())
            .and_then(|offset| self.args_buffer.offset(offset))
    }

    /// Bytes spanned by the argument records, from the first record's start
    /// to the last record's end.
    pub fn args_span(&self) -> Option<u64> {
        u64::from(self.arg_count.saturating_sub(1))
            .checked_mul(self.args_stride_in_bytes)
            .and_then(|bytes| bytes.checked_add(self.op.args_record_size().into()))
    }
}

/// A cluster acceleration structure implementation.
pub trait ClusterAccelBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &BackendCapabilities;

    /// Structure storage and scratch required by `op` under `limits`.
    ///
    /// `result_size` excludes the packed handle table; the size query engine
    /// adds it.
    fn cluster_accel_sizes(
        &self,
        op: ClusterAccelBuildOp,
        limits: &Limits,
    ) -> Result<ClusterAccelSizes>;

    /// Runs `command` against `memory`.
    ///
    /// Per-argument failures are written as zero handles and zero sizes. An
    /// error means the command could not run at all.
    fn build_cluster_accel(
        &self,
        memory: &mut dyn DeviceMemory,
        command: &BuildCommand,
    ) -> Result<()>;

    /// Describes the structure `handle` refers to.
    fn inspect(
        &self,
        _memory: &dyn DeviceMemory,
        _handle: Handle,
    ) -> Result<Option<StructureInfo>> {
        Ok(None)
    }
}

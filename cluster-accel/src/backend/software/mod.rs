//! Host implementation of the cluster acceleration backend contract.
//!
//! Builds real (if simple) structures in device memory: a CLAS holds its
//! decoded, truncated positions and its topology, a template holds topology
//! and optionally positions, a BLAS holds the handles of its clusters. Handles
//! are the device addresses of the structures, so later builds can follow
//! them, and [`inspect()`](ClusterAccelBackend::inspect) can describe them.
use crate::backend::{
    BackendCapabilities, BuildCommand, ClusterAccelBackend, DeviceMemory, StructureInfo,
};
use crate::desc::{ClusterAccelBuildOp, Limits};
use crate::error::Result;
use crate::sizes::ClusterAccelSizes;
use crate::Handle;

mod blob;
mod build;
mod sizing;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftwareBackendOptions {
    pub capabilities: BackendCapabilities,
}

#[derive(Debug, Default)]
pub struct SoftwareBackend {
    options: SoftwareBackendOptions,
}

impl SoftwareBackend {
    pub fn new(options: SoftwareBackendOptions) -> Self {
        Self { options }
    }
}

impl ClusterAccelBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.options.capabilities
    }

    fn cluster_accel_sizes(
        &self,
        op: ClusterAccelBuildOp,
        limits: &Limits,
    ) -> Result<ClusterAccelSizes> {
        sizing::sizes(&self.options.capabilities, op, limits)
    }

    fn build_cluster_accel(
        &self,
        memory: &mut dyn DeviceMemory,
        command: &BuildCommand,
    ) -> Result<()> {
        build::execute(memory, command)
    }

    fn inspect(&self, memory: &dyn DeviceMemory, handle: Handle) -> Result<Option<StructureInfo>> {
        if !handle.is_valid() {
            return Ok(None);
        }
        Ok(blob::BlobHeader::read(memory, handle.address()).and_then(|header| header.info()))
    }
}

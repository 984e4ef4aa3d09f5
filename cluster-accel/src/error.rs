//! Error types for the cluster-accel crate.

use crate::abi::CodecError;
use crate::desc::ClusterAccelBuildOp;
use crate::device::Feature;
use crate::validate::ValidationError;
use crate::DeviceAddress;
use thiserror::Error;

/// Main error type for cluster acceleration structure operations.
///
/// A build that executes but fails on the device is not reported here; it
/// shows up as a zero [`Handle`](crate::Handle) after readback.
#[derive(Debug, Error)]
pub enum Error {
    /// The build descriptor failed validation. Nothing was recorded.
    #[error("Invalid cluster acceleration build descriptor: {0}")]
    DescriptorInvalid(#[from] ValidationError),

    /// The backend rejected a descriptor that passed validation.
    #[error("Backend cannot size {op}: {reason}")]
    SizingFailure {
        op: ClusterAccelBuildOp,
        reason: String,
    },

    /// A build command is structurally broken and was not recorded.
    #[error("Invalid build command: {0}")]
    BuildCommandInvalid(String),

    /// The device lacks a feature the call requires.
    #[error("Feature not available: {0}")]
    FeatureNotAvailable(Feature),

    /// An argument record could not be packed or unpacked.
    #[error("Argument record codec error: {0}")]
    Codec(#[from] CodecError),

    /// A device memory access does not fall inside one live buffer.
    #[error("Device memory access of {len} bytes at {address} is out of bounds")]
    AddressOutOfBounds { address: DeviceAddress, len: u64 },

    /// Invalid buffer size.
    #[error("Invalid buffer size: expected {expected}, got {actual}")]
    InvalidBufferSize { expected: u64, actual: u64 },

    /// The device could not run a submitted command at all.
    #[error("Device fault: {0}")]
    DeviceFault(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns `true` for errors raised before anything was recorded or
    /// submitted, i.e. the caller can fix its inputs and retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::DeviceFault(_))
    }
}

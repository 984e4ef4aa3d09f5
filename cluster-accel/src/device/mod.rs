//! # Reference Device
//!
//! A host-memory implementation of the collaborators a build needs: buffers
//! with 64-bit device addresses, a command encoder and an in-order queue.
//! Builds run on the configured [`ClusterAccelBackend`] when the queue is
//! drained by [`Device::wait()`].
//!
//! The device is a cheap, cloneable handle; all clones share one heap and
//! one queue.
use crate::backend::{
    ClusterAccelBackend, SoftwareBackend, SoftwareBackendOptions, StructureInfo,
};
use crate::command::{CommandBuffer, CommandEncoder};
use crate::desc::ClusterAccelBuildDesc;
use crate::error::{Error, Result};
use crate::handles::HandleReport;
use crate::sizes::{ClusterAccelSizes, SizeCache};
use crate::{DeviceAddress, Handle};
use cluster_accel_sys as sys;
use derive_more::{BitAnd, BitOr, Display};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

mod heap;

pub(crate) use heap::MemoryHeap;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Feature {
    #[display("ray tracing")]
    RayTracing,
    #[display("cluster acceleration structures")]
    ClusterAccelerationStructure,
}

/// How a buffer is going to be used. Informational only; the reference
/// device does not restrict access by usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, BitOr, BitAnd)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const NONE: Self = Self(0);
    /// Argument records, geometry, handle lists.
    pub const BUILD_INPUT: Self = Self(1 << 0);
    /// Result storage and handle tables.
    pub const ACCELERATION_STRUCTURE: Self = Self(1 << 1);
    pub const SCRATCH: Self = Self(1 << 2);
    pub const READBACK: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        other.0 == self.0 & other.0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub usage: BufferUsage,
    pub size: u64,
    /// Initial contents; the rest of the buffer is zeroed.
    pub data: Option<&'a [u8]>,
}

impl<'a> BufferDesc<'a> {
    /// A zero-initialized buffer of `size` bytes.
    pub fn new(label: &'a str, usage: BufferUsage, size: u64) -> Self {
        Self {
            label,
            usage,
            size,
            data: None,
        }
    }

    /// A buffer holding exactly `data`.
    pub fn with_data(label: &'a str, usage: BufferUsage, data: &'a [u8]) -> Self {
        Self {
            label,
            usage,
            size: data.len() as u64,
            data: Some(data),
        }
    }
}

struct BufferInner {
    address: DeviceAddress,
    size: u64,
    usage: BufferUsage,
    label: String,
    heap: Arc<Mutex<MemoryHeap>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free(self.address);
    }
}

/// A device buffer. Clones share the allocation, which is freed when the
/// last clone drops; addresses and handles into it dangle afterwards.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.inner.label)
            .field("address", &self.inner.address)
            .field("size", &self.inner.size)
            .field("usage", &self.inner.usage)
            .finish()
    }
}

impl Buffer {
    #[inline]
    pub fn device_address(&self) -> DeviceAddress {
        self.inner.address
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<DeviceAddress> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size() => self
                .device_address()
                .offset(offset)
                .ok_or(Error::AddressOutOfBounds {
                    address: self.device_address(),
                    len: end,
                }),
            _ => Err(Error::InvalidBufferSize {
                expected: end.unwrap_or(u64::MAX),
                actual: self.size(),
            }),
        }
    }

    /// Host write: copies `src` into the buffer at `offset`, immediately.
    ///
    /// This bypasses the command stream; do not call it while a submitted
    /// build may still read the range.
    pub fn set_data(&self, src: &[u8], offset: u64) -> Result<()> {
        use crate::backend::DeviceMemory;

        let address = self.check_range(offset, src.len())?;
        self.inner
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(address, src)
    }
}

/// A buffer and a byte offset into it.
#[derive(Clone, Debug)]
pub struct BufferOffsetPair {
    pub buffer: Buffer,
    pub offset: u64,
}

impl BufferOffsetPair {
    pub fn new(buffer: &Buffer, offset: u64) -> Self {
        Self {
            buffer: buffer.clone(),
            offset,
        }
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        (self.offset < self.buffer.size())
            .then(|| self.buffer.device_address().offset(self.offset))
            .flatten()
    }

    /// Bytes from the offset to the end of the buffer.
    pub fn remaining(&self) -> u64 {
        self.buffer.size().saturating_sub(self.offset)
    }
}

impl From<&Buffer> for BufferOffsetPair {
    fn from(buffer: &Buffer) -> Self {
        Self::new(buffer, 0)
    }
}

/// Which backend a [`Device`] runs builds on.
#[derive(Clone, Debug)]
pub enum DeviceBackend {
    Software(SoftwareBackendOptions),
    Custom(Arc<dyn ClusterAccelBackend>),
}

impl Default for DeviceBackend {
    fn default() -> Self {
        DeviceBackend::Software(SoftwareBackendOptions::default())
    }
}

#[derive(Clone, Debug)]
pub struct DeviceOptions {
    pub backend: DeviceBackend,
    pub features: Vec<Feature>,
    /// First device address handed out. Never zero.
    pub base_address: u64,
    /// Alignment of every buffer's device address. A power of two of at
    /// least 256, so any buffer can hold a BLAS at offset zero.
    pub address_alignment: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::default(),
            features: vec![Feature::RayTracing, Feature::ClusterAccelerationStructure],
            base_address: 0x1_0000_0000,
            address_alignment: sys::ACCEL_BUFFER_BYTE_ALIGNMENT,
        }
    }
}

struct DeviceShared {
    backend: Arc<dyn ClusterAccelBackend>,
    features: Vec<Feature>,
    heap: Arc<Mutex<MemoryHeap>>,
    queue: Mutex<VecDeque<CommandBuffer>>,
    size_cache: SizeCache,
}

#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.shared.backend.name())
            .field("features", &self.shared.features)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(options: DeviceOptions) -> Result<Self> {
        if !options.address_alignment.is_power_of_two()
            || options.address_alignment < sys::ACCEL_BUFFER_BYTE_ALIGNMENT
        {
            return Err(Error::InvalidBufferSize {
                expected: sys::ACCEL_BUFFER_BYTE_ALIGNMENT,
                actual: options.address_alignment,
            });
        }

        let backend: Arc<dyn ClusterAccelBackend> = match options.backend {
            DeviceBackend::Software(software) => Arc::new(SoftwareBackend::new(software)),
            DeviceBackend::Custom(backend) => backend,
        };
        log::debug!(
            "Created device on `{}` backend with {:?}",
            backend.name(),
            options.features
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                backend,
                features: options.features,
                heap: Arc::new(Mutex::new(MemoryHeap::new(
                    options.base_address,
                    options.address_alignment,
                ))),
                queue: Mutex::new(VecDeque::new()),
                size_cache: SizeCache::new(),
            }),
        })
    }

    pub fn backend(&self) -> &dyn ClusterAccelBackend {
        self.shared.backend.as_ref()
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.shared.features.contains(&feature)
    }

    pub(crate) fn require_feature(&self, feature: Feature) -> Result<()> {
        if self.has_feature(feature) {
            Ok(())
        } else {
            Err(Error::FeatureNotAvailable(feature))
        }
    }

    /// Cluster builds need ray tracing as well as the cluster extension.
    pub(crate) fn require_cluster_features(&self) -> Result<()> {
        self.require_feature(Feature::RayTracing)?;
        self.require_feature(Feature::ClusterAccelerationStructure)
    }

    pub(crate) fn heap(&self) -> MutexGuard<'_, MemoryHeap> {
        self.shared
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<CommandBuffer>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<Buffer> {
        use crate::backend::DeviceMemory;

        if 0 == desc.size {
            return Err(Error::InvalidBufferSize {
                expected: 1,
                actual: 0,
            });
        }
        if let Some(data) = desc.data {
            if data.len() as u64 > desc.size {
                return Err(Error::InvalidBufferSize {
                    expected: desc.size,
                    actual: data.len() as u64,
                });
            }
        }

        let address = {
            let mut heap = self.heap();
            let address = heap.allocate(desc.size)?;
            if let Some(data) = desc.data {
                heap.write(address, data)?;
            }
            address
        };
        log::debug!(
            "Created buffer `{}`: {} bytes at {address}",
            desc.label,
            desc.size
        );

        Ok(Buffer {
            inner: Arc::new(BufferInner {
                address,
                size: desc.size,
                usage: desc.usage,
                label: desc.label.to_owned(),
                heap: Arc::clone(&self.shared.heap),
            }),
        })
    }

    /// Copies buffer contents at `offset` into `dst`.
    ///
    /// Only meaningful after [`wait()`](Self::wait): contents written by
    /// pending command buffers are not there yet.
    pub fn read_buffer_data(&self, buffer: &Buffer, dst: &mut [u8], offset: u64) -> Result<()> {
        use crate::backend::DeviceMemory;

        let pending = self.queue().len();
        if 0 != pending {
            log::warn!(
                "Reading buffer `{}` with {pending} command buffer(s) pending; call wait() first",
                buffer.label()
            );
        }
        let address = buffer.check_range(offset, dst.len())?;
        self.heap().read(address, dst)
    }

    pub fn create_command_encoder(&self) -> CommandEncoder {
        CommandEncoder::new(self.clone())
    }

    /// Enqueues `command_buffer`. It runs on the next [`wait()`](Self::wait).
    pub fn submit_command_buffer(&self, command_buffer: CommandBuffer) {
        log::debug!(
            "Submitted command buffer with {} command(s)",
            command_buffer.len()
        );
        self.queue().push_back(command_buffer);
    }

    /// Runs all submitted command buffers in submission order.
    ///
    /// A command buffer that faults aborts the wait; it and every command
    /// buffer behind it are dropped.
    pub fn wait(&self) -> Result<()> {
        loop {
            let Some(command_buffer) = self.queue().pop_front() else {
                return Ok(());
            };

            let result = {
                let mut heap = self.heap();
                command_buffer.execute(&mut *heap, self.backend())
            };
            // Dropped outside the heap lock: it may hold the last clone of a
            // buffer.
            drop(command_buffer);

            if let Err(err) = result {
                let dropped = std::mem::take(&mut *self.queue());
                if !dropped.is_empty() {
                    log::warn!(
                        "Dropping {} command buffer(s) after device fault",
                        dropped.len()
                    );
                }
                return Err(err);
            }
        }
    }

    /// Result and scratch sizes for `desc`, cached by operation and limits.
    pub fn get_cluster_acceleration_structure_sizes(
        &self,
        desc: &ClusterAccelBuildDesc,
    ) -> Result<ClusterAccelSizes> {
        self.require_cluster_features()?;
        self.shared
            .size_cache
            .get_or_query(self.backend(), desc)
    }

    /// Reads `count` tightly packed handles at `offset`.
    pub fn read_handles(&self, buffer: &Buffer, offset: u64, count: usize) -> Result<HandleReport> {
        self.read_handles_strided(buffer, offset, count, sys::HANDLE_STRIDE_IN_BYTES)
    }

    pub fn read_handles_strided(
        &self,
        buffer: &Buffer,
        offset: u64,
        count: usize,
        stride: u32,
    ) -> Result<HandleReport> {
        let bytes = self.read_table(buffer, offset, count, stride, 8)?;
        Ok(HandleReport::new(
            bytes
                .chunks_exact(8)
                .map(|b| Handle::from_raw(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
                .collect(),
        ))
    }

    /// Reads `count` tightly packed per-argument sizes at `offset`.
    pub fn read_sizes(&self, buffer: &Buffer, offset: u64, count: usize) -> Result<Vec<u32>> {
        let bytes = self.read_table(buffer, offset, count, sys::SIZE_STRIDE_IN_BYTES, 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn read_table(
        &self,
        buffer: &Buffer,
        offset: u64,
        count: usize,
        stride: u32,
        entry_size: usize,
    ) -> Result<Vec<u8>> {
        let mut entries = vec![0u8; count * entry_size];
        for (i, entry) in entries.chunks_exact_mut(entry_size).enumerate() {
            let at = u64::from(stride)
                .checked_mul(i as u64)
                .and_then(|bytes| bytes.checked_add(offset))
                .ok_or(Error::InvalidBufferSize {
                    expected: u64::MAX,
                    actual: buffer.size(),
                })?;
            self.read_buffer_data(buffer, entry, at)?;
        }
        Ok(entries)
    }

    /// Backend metadata of the structure `handle` refers to, if the backend
    /// can describe it.
    pub fn inspect_structure(&self, handle: Handle) -> Result<Option<StructureInfo>> {
        let heap = self.heap();
        self.backend().inspect(&*heap, handle)
    }
}

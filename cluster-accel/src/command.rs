//! # Command Recording
//!
//! A [`CommandEncoder`] records builds, in-stream buffer writes and barriers
//! into a [`CommandBuffer`]. Nothing runs at recording time; every check that
//! can be made without running the build is made here, so a recorded build
//! only fails per argument (zero handles) or, if the device cannot run it at
//! all, as a fault reported by [`Device::wait()`](crate::Device::wait).
//!
//! Argument records written in the stream with
//! [`write_buffer()`](CommandEncoder::write_buffer) are only visible to a
//! later build after [`record_barrier()`](CommandEncoder::record_barrier). The
//! encoder does not insert barriers. With the `hazard_tracking` feature it
//! reports builds that read an unbarriered write as [`Hazard`]s.
use crate::backend::{BuildCommand, ClusterAccelBackend, DeviceMemory};
use crate::desc::{BuildMode, ClusterAccelBuildDesc, ClusterAccelBuildOp, ImplicitBuildParams};
use crate::device::{Buffer, BufferOffsetPair, Device};
use crate::error::{Error, Result};
use crate::sizes::handle_table_size;
use crate::validate::validate;
use crate::DeviceAddress;
use cluster_accel_sys as sys;

#[derive(Debug)]
enum Command {
    Barrier,
    WriteBuffer {
        buffer: Buffer,
        offset: u64,
        data: Vec<u8>,
    },
    Build(BuildCommand),
}

/// A build that reads argument records written earlier in the same stream
/// without a barrier in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hazard {
    /// Position of the build in the command buffer.
    pub command_index: usize,
    pub op: ClusterAccelBuildOp,
    pub args_buffer: DeviceAddress,
    pub args_len: u64,
    pub write_address: DeviceAddress,
    pub write_len: u64,
}

/// Recorded commands, ready for
/// [`Device::submit_command_buffer()`](crate::Device::submit_command_buffer).
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    hazards: Vec<Hazard>,
}

impl CommandBuffer {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn build_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Build(_)))
            .count()
    }

    /// Missing-barrier hazards found while recording. Always empty without
    /// the `hazard_tracking` feature.
    pub fn hazards(&self) -> &[Hazard] {
        &self.hazards
    }

    pub(crate) fn execute(
        &self,
        memory: &mut dyn DeviceMemory,
        backend: &dyn ClusterAccelBackend,
    ) -> Result<()> {
        for command in &self.commands {
            match command {
                Command::Barrier => log::trace!("Barrier"),
                Command::WriteBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    let address = buffer.device_address().offset(*offset).ok_or_else(|| {
                        Error::DeviceFault(format!("write to `{}` overflows", buffer.label()))
                    })?;
                    memory.write(address, data).map_err(|err| {
                        Error::DeviceFault(format!("write to `{}`: {err}", buffer.label()))
                    })?;
                }
                Command::Build(build) => backend.build_cluster_accel(memory, build)?,
            }
        }
        Ok(())
    }
}

pub struct CommandEncoder {
    device: Device,
    commands: Vec<Command>,
    hazards: Vec<Hazard>,
    /// `(address, len)` of in-stream writes since the last barrier.
    #[cfg(feature = "hazard_tracking")]
    unbarriered_writes: Vec<(u64, u64)>,
}

fn table_span(count: u32, stride: u32, entry_size: u32) -> Option<u64> {
    u64::from(count.saturating_sub(1))
        .checked_mul(stride.into())
        .and_then(|bytes| bytes.checked_add(entry_size.into()))
}

impl CommandEncoder {
    pub(crate) fn new(device: Device) -> Self {
        Self {
            device,
            commands: Vec::new(),
            hazards: Vec::new(),
            #[cfg(feature = "hazard_tracking")]
            unbarriered_writes: Vec::new(),
        }
    }

    /// Makes all earlier in-stream writes visible to later commands.
    pub fn record_barrier(&mut self) {
        self.commands.push(Command::Barrier);
        #[cfg(feature = "hazard_tracking")]
        self.unbarriered_writes.clear();
    }

    /// Records a device-side write of `data` into `buffer` at `offset`.
    pub fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > buffer.size()) {
            return Err(Error::InvalidBufferSize {
                expected: end.unwrap_or(u64::MAX),
                actual: buffer.size(),
            });
        }

        #[cfg(feature = "hazard_tracking")]
        self.unbarriered_writes
            .push((buffer.device_address().raw() + offset, data.len() as u64));
        self.commands.push(Command::WriteBuffer {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Records a build using the buffers of `desc.mode`.
    pub fn build_cluster_acceleration_structure(
        &mut self,
        desc: &ClusterAccelBuildDesc,
    ) -> Result<()> {
        self.device.require_cluster_features()?;

        if desc.args_buffer.is_null() {
            return Err(Error::BuildCommandInvalid("`args_buffer` is null".into()));
        }
        if 0 == desc.arg_count {
            return Err(Error::BuildCommandInvalid("`arg_count` is zero".into()));
        }
        if 0 == desc.args_stride_in_bytes {
            return Err(Error::BuildCommandInvalid(
                "`args_stride_in_bytes` is zero".into(),
            ));
        }

        validate(desc)?;

        let sizes = self.device.get_cluster_acceleration_structure_sizes(desc)?;
        let command = {
            let heap = self.device.heap();
            let command = BuildCommand::resolve(desc, &*heap)?;
            check_buffers(&command, &*heap, sizes.scratch_size, sizes.storage_size(desc.limits()))?;
            command
        };

        self.track_hazards(&command);
        log::debug!(
            "Recorded {} ({} mode) over {} argument(s)",
            command.op,
            command.mode,
            command.arg_count
        );
        self.commands.push(Command::Build(command));
        Ok(())
    }

    /// Records a build into a packed result.
    ///
    /// The handle table occupies the head of `result` (one 8 byte handle per
    /// argument, padded to 128 bytes for `max_arg_count` arguments) and the
    /// structures follow it, so the first 8 bytes of `result` hold the first
    /// argument's handle. `result` needs
    /// [`result_size`](crate::ClusterAccelSizes::result_size) bytes and
    /// `scratch` [`scratch_size`](crate::ClusterAccelSizes::scratch_size)
    /// bytes. Any mode set on `desc` is ignored.
    pub fn build_cluster_acceleration_structure_into(
        &mut self,
        desc: &ClusterAccelBuildDesc,
        scratch: BufferOffsetPair,
        result: BufferOffsetPair,
    ) -> Result<()> {
        self.device.require_cluster_features()?;

        let table = handle_table_size(desc.limits().max_arg_count())
            .ok_or_else(|| Error::BuildCommandInvalid("handle table size overflows".into()))?;
        let (Some(result_address), Some(scratch_address)) = (result.address(), scratch.address())
        else {
            return Err(Error::BuildCommandInvalid(
                "result or scratch offset is past the end of its buffer".into(),
            ));
        };
        let storage = result.remaining().saturating_sub(table);
        let output_buffer = result_address.offset(table).filter(|_| 0 != storage).ok_or_else(|| {
            Error::BuildCommandInvalid(format!(
                "result buffer `{}` has no room behind its {table} byte handle table",
                result.buffer.label()
            ))
        })?;

        let packed = desc.with_mode(ImplicitBuildParams {
            output_buffer,
            output_buffer_size_in_bytes: storage,
            temp_buffer: scratch_address,
            temp_buffer_size_in_bytes: scratch.remaining(),
            output_handles_buffer: result_address,
            output_handles_stride_in_bytes: sys::HANDLE_STRIDE_IN_BYTES,
            output_sizes_buffer: DeviceAddress::NULL,
            output_sizes_stride_in_bytes: 0,
        });
        self.build_cluster_acceleration_structure(&packed)
    }

    #[cfg(feature = "hazard_tracking")]
    fn track_hazards(&mut self, command: &BuildCommand) {
        let start = command.args_buffer.raw();
        let len = command.args_span().unwrap_or(u64::MAX);
        let end = start.saturating_add(len);

        for &(write, write_len) in &self.unbarriered_writes {
            if write < end && start < write.saturating_add(write_len) {
                let hazard = Hazard {
                    command_index: self.commands.len(),
                    op: command.op,
                    args_buffer: command.args_buffer,
                    args_len: len,
                    write_address: DeviceAddress::new(write),
                    write_len,
                };
                log::warn!(
                    "{} reads argument records at {} written in-stream at {} without a barrier",
                    hazard.op,
                    hazard.args_buffer,
                    hazard.write_address
                );
                self.hazards.push(hazard);
            }
        }
    }

    #[cfg(not(feature = "hazard_tracking"))]
    fn track_hazards(&mut self, _command: &BuildCommand) {}

    pub fn finish(self) -> CommandBuffer {
        CommandBuffer {
            commands: self.commands,
            hazards: self.hazards,
        }
    }
}

/// Checks that every buffer the build touches exists and is large enough.
fn check_buffers(
    command: &BuildCommand,
    memory: &dyn DeviceMemory,
    scratch_size: u64,
    storage_size: u64,
) -> Result<()> {
    let require = |field: &str, address: DeviceAddress, needed: Option<u64>| -> Result<()> {
        let needed = needed.ok_or_else(|| {
            Error::BuildCommandInvalid(format!("`{field}` size overflows"))
        })?;
        let available = memory.extent(address).unwrap_or(0);
        if available < needed {
            Err(Error::BuildCommandInvalid(format!(
                "`{field}` at {address} needs {needed} bytes, {available} available"
            )))
        } else {
            Ok(())
        }
    };
    let at_least = |field: &str, size: u64, needed: u64| -> Result<()> {
        if size < needed {
            Err(Error::BuildCommandInvalid(format!(
                "`{field}` is {size} bytes, the build needs {needed}"
            )))
        } else {
            Ok(())
        }
    };

    let count = command.arg_count;
    let handle = sys::HANDLE_STRIDE_IN_BYTES;
    let size = sys::SIZE_STRIDE_IN_BYTES;

    require("args_buffer", command.args_buffer, command.args_span())?;

    match &command.mode {
        BuildMode::Implicit(p) => {
            at_least("temp_buffer_size_in_bytes", p.temp_buffer_size_in_bytes, scratch_size)?;
            require("temp_buffer", p.temp_buffer, Some(p.temp_buffer_size_in_bytes))?;
            at_least(
                "output_buffer_size_in_bytes",
                p.output_buffer_size_in_bytes,
                storage_size,
            )?;
            require("output_buffer", p.output_buffer, Some(p.output_buffer_size_in_bytes))?;
            require(
                "output_handles_buffer",
                p.output_handles_buffer,
                table_span(count, p.output_handles_stride_in_bytes, handle),
            )?;
            if !p.output_sizes_buffer.is_null() {
                require(
                    "output_sizes_buffer",
                    p.output_sizes_buffer,
                    table_span(count, p.output_sizes_stride_in_bytes, size),
                )?;
            }
        }
        BuildMode::ExplicitDestinations(p) => {
            at_least("temp_buffer_size_in_bytes", p.temp_buffer_size_in_bytes, scratch_size)?;
            require("temp_buffer", p.temp_buffer, Some(p.temp_buffer_size_in_bytes))?;
            require(
                "dest_addresses_buffer",
                p.dest_addresses_buffer,
                table_span(count, p.dest_addresses_stride_in_bytes, handle),
            )?;
            if !p.output_handles_buffer.is_null() {
                require(
                    "output_handles_buffer",
                    p.output_handles_buffer,
                    table_span(count, p.output_handles_stride_in_bytes, handle),
                )?;
            }
            if !p.output_sizes_buffer.is_null() {
                require(
                    "output_sizes_buffer",
                    p.output_sizes_buffer,
                    table_span(count, p.output_sizes_stride_in_bytes, size),
                )?;
            }
        }
        BuildMode::GetSizes(p) => {
            at_least("temp_buffer_size_in_bytes", p.temp_buffer_size_in_bytes, scratch_size)?;
            require("temp_buffer", p.temp_buffer, Some(p.temp_buffer_size_in_bytes))?;
            require(
                "output_sizes_buffer",
                p.output_sizes_buffer,
                table_span(count, p.output_sizes_stride_in_bytes, size),
            )?;
        }
    }
    Ok(())
}

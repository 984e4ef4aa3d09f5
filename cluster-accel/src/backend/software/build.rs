use super::blob::{merge_bounds, BlasBlob, BlobHeader, ClusterBlob};
use crate::abi::{ArgsRecord, ClustersArgs, CodecError, PrimitiveInfo, TemplatesArgs, TrianglesArgs};
use crate::backend::{BuildCommand, DeviceMemory, StructureKind};
use crate::desc::{
    BuildMode, ClusterAccelBuildOp, ExplicitDestinationsParams, GetSizesParams,
    ImplicitBuildParams, Limits, LimitsClusters, LimitsFamily, LimitsTriangles,
};
use crate::error::{Error, Result};
use crate::{align_up, DeviceAddress, Handle};
use cluster_accel_sys::{IndicesFormat, MAX_POSITION_TRUNCATE_BIT_COUNT, SBT_INDEX_BITS};
use derive_more::Display;
use std::collections::HashSet;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Why one argument produced no structure.
#[derive(Debug, Display)]
enum ArgFailure {
    #[display("malformed argument record: {_0}")]
    Record(CodecError),
    #[display("`{_0}` is zero")]
    Empty(&'static str),
    #[display("`{what}` {count} exceeds the limit of {limit}")]
    OverLimit {
        what: &'static str,
        count: u32,
        limit: u32,
    },
    #[display("`{_0}` is null")]
    NullBuffer(&'static str),
    #[display("cannot read `{_0}`")]
    Unreadable(&'static str),
    #[display("index {index} of triangle {triangle} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        triangle: u32,
        index: u32,
        vertex_count: u32,
    },
    #[display("`position_truncate_bit_count` {_0} is above 32")]
    Truncation(u32),
    #[display("cluster handle {_0} is zero")]
    ZeroClusterHandle(u32),
    #[display("{_0} is not a valid {_1}")]
    WrongStructure(Handle, StructureKind),
    #[display("`{_0}` overflows")]
    Overflow(&'static str),
    #[display("{_0} cannot run with {_1} limits")]
    LimitsMismatch(ClusterAccelBuildOp, LimitsFamily),
    #[display("output buffer is full")]
    OutputFull,
    #[display("destination {_0} is not aligned to {_1} bytes")]
    MisalignedDestination(DeviceAddress, u64),
    #[display("cannot write {_1} bytes to {_0}")]
    Unwritable(DeviceAddress, usize),
}

impl From<CodecError> for ArgFailure {
    fn from(err: CodecError) -> Self {
        ArgFailure::Record(err)
    }
}

type ArgResult<T> = std::result::Result<T, ArgFailure>;

fn fault(what: &str, err: Error) -> Error {
    Error::DeviceFault(format!("{what}: {err}"))
}

fn check_count(what: &'static str, count: u32, limit: u32) -> ArgResult<()> {
    if 0 == count {
        Err(ArgFailure::Empty(what))
    } else if count > limit {
        Err(ArgFailure::OverLimit { what, count, limit })
    } else {
        Ok(())
    }
}

/// Reads `count` elements of `element_size` bytes, `stride` bytes apart.
fn read_strided(
    memory: &dyn DeviceMemory,
    address: DeviceAddress,
    count: u32,
    stride: u64,
    element_size: u64,
    what: &'static str,
) -> ArgResult<Vec<u8>> {
    let span = u64::from(count.saturating_sub(1))
        .checked_mul(stride)
        .and_then(|bytes| bytes.checked_add(element_size))
        .ok_or(ArgFailure::Overflow(what))?;
    let bytes = memory
        .read_vec(address, span)
        .map_err(|_| ArgFailure::Unreadable(what))?;

    let (stride, element_size) = (stride as usize, element_size as usize);
    let mut elements = Vec::with_capacity(count as usize * element_size);
    for i in 0..count as usize {
        elements.extend_from_slice(&bytes[i * stride..i * stride + element_size]);
    }
    Ok(elements)
}

fn truncate(value: f32, bits: u32) -> f32 {
    match bits {
        0 => value,
        32.. => 0.0,
        _ => f32::from_bits(value.to_bits() & (u32::MAX << bits)),
    }
}

fn read_positions(
    memory: &dyn DeviceMemory,
    vertex_buffer: DeviceAddress,
    vertex_count: u32,
    stride: u64,
    truncate_bits: u32,
) -> ArgResult<Vec<[f32; 3]>> {
    if vertex_buffer.is_null() {
        return Err(ArgFailure::NullBuffer("vertex_buffer"));
    }
    let bytes = read_strided(memory, vertex_buffer, vertex_count, stride, 12, "vertex_buffer")?;
    Ok(bytes
        .chunks_exact(12)
        .map(|chunk| {
            let component = |i: usize| {
                let raw = f32::from_le_bytes([
                    chunk[4 * i],
                    chunk[4 * i + 1],
                    chunk[4 * i + 2],
                    chunk[4 * i + 3],
                ]);
                truncate(raw, truncate_bits)
            };
            [component(0), component(1), component(2)]
        })
        .collect())
}

fn read_triangles(memory: &dyn DeviceMemory, args: &TrianglesArgs) -> ArgResult<Vec<[u32; 3]>> {
    if args.index_buffer.is_null() {
        return Err(ArgFailure::NullBuffer("index_buffer"));
    }
    let element_size = args.index_format.element_size();
    let bytes = read_strided(
        memory,
        args.index_buffer,
        args.triangle_count * 3,
        args.effective_index_stride(),
        element_size.into(),
        "index_buffer",
    )?;

    let indices = bytes.chunks_exact(element_size as usize).map(|b| match args.index_format {
        IndicesFormat::Bits8 => u32::from(b[0]),
        IndicesFormat::Bits16 => u32::from(u16::from_le_bytes([b[0], b[1]])),
        IndicesFormat::Bits32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    });

    let mut triangles = vec![[0u32; 3]; args.triangle_count as usize];
    for (k, index) in indices.enumerate() {
        if index >= args.vertex_count {
            return Err(ArgFailure::IndexOutOfRange {
                triangle: (k / 3) as u32,
                index,
                vertex_count: args.vertex_count,
            });
        }
        triangles[k / 3][k % 3] = index;
    }
    Ok(triangles)
}

fn read_primitive_infos(
    memory: &dyn DeviceMemory,
    args: &TrianglesArgs,
) -> ArgResult<Vec<PrimitiveInfo>> {
    if args.primitive_info_buffer.is_null() {
        return Ok(vec![args.base_primitive_info; args.triangle_count as usize]);
    }
    let bytes = read_strided(
        memory,
        args.primitive_info_buffer,
        args.triangle_count,
        args.effective_primitive_info_stride(),
        4,
        "primitive_info_buffer",
    )?;
    bytes
        .chunks_exact(4)
        .map(|b| {
            PrimitiveInfo::unpack(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .map_err(ArgFailure::from)
        })
        .collect()
}

fn pack_infos(infos: &[PrimitiveInfo], limits: &LimitsTriangles) -> ArgResult<Vec<u32>> {
    let unique = infos.iter().map(|info| info.sbt_index).collect::<HashSet<_>>();
    if unique.len() as u32 > limits.max_unique_sbt_index_count_per_arg {
        return Err(ArgFailure::OverLimit {
            what: "unique sbt index count",
            count: unique.len() as u32,
            limit: limits.max_unique_sbt_index_count_per_arg,
        });
    }
    infos
        .iter()
        .map(|info| info.pack().map_err(ArgFailure::from))
        .collect()
}

fn effective_truncation(requested: u32, limits: &LimitsTriangles) -> ArgResult<u32> {
    let bits = requested.max(limits.position_truncate_bit_count);
    if bits > MAX_POSITION_TRUNCATE_BIT_COUNT {
        Err(ArgFailure::Truncation(bits))
    } else {
        Ok(bits)
    }
}

fn build_from_triangles(
    memory: &dyn DeviceMemory,
    limits: &LimitsTriangles,
    record: &[u8],
    kind: StructureKind,
) -> ArgResult<Vec<u8>> {
    let args = TrianglesArgs::unpack(record)?;
    check_count("triangle_count", args.triangle_count, limits.max_triangle_count_per_arg)?;
    check_count("vertex_count", args.vertex_count, limits.max_vertex_count_per_arg)?;
    let truncate_bits = effective_truncation(args.position_truncate_bit_count, limits)?;

    // Templates may leave positions to the instances.
    let positions = if StructureKind::Template == kind && args.vertex_buffer.is_null() {
        Vec::new()
    } else {
        read_positions(
            memory,
            args.vertex_buffer,
            args.vertex_count,
            args.effective_vertex_stride(),
            truncate_bits,
        )?
    };
    let triangles = read_triangles(memory, &args)?;
    let primitive_infos = pack_infos(&read_primitive_infos(memory, &args)?, limits)?;

    Ok(ClusterBlob {
        kind,
        cluster_id: args.cluster_id,
        cluster_flags: args.cluster_flags,
        position_truncate_bit_count: truncate_bits,
        positions,
        vertex_count: args.vertex_count,
        primitive_infos,
        triangles,
    }
    .encode())
}

fn instantiate_template(
    memory: &dyn DeviceMemory,
    limits: &LimitsTriangles,
    record: &[u8],
) -> ArgResult<Vec<u8>> {
    let args = TemplatesArgs::unpack(record)?;
    if !args.cluster_template.is_valid() {
        return Err(ArgFailure::NullBuffer("cluster_template"));
    }
    let template = ClusterBlob::read(memory, args.cluster_template.address())
        .filter(|blob| StructureKind::Template == blob.kind)
        .ok_or(ArgFailure::WrongStructure(
            args.cluster_template,
            StructureKind::Template,
        ))?;

    let triangle_count = template.triangles.len() as u32;
    check_count("triangle_count", triangle_count, limits.max_triangle_count_per_arg)?;
    check_count("vertex_count", template.vertex_count, limits.max_vertex_count_per_arg)?;
    let truncate_bits = effective_truncation(template.position_truncate_bit_count, limits)?;

    let positions = read_positions(
        memory,
        args.vertex_buffer,
        template.vertex_count,
        args.effective_vertex_stride(),
        truncate_bits,
    )?;
    let cluster_id = template
        .cluster_id
        .checked_add(args.cluster_id_offset)
        .ok_or(ArgFailure::Overflow("cluster_id"))?;

    let infos = template
        .primitive_infos
        .iter()
        .map(|&word| -> ArgResult<PrimitiveInfo> {
            let mut info = PrimitiveInfo::unpack(word)?;
            info.sbt_index = info
                .sbt_index
                .checked_add(args.sbt_index_offset)
                .filter(|&index| index <= SBT_INDEX_BITS.max_value())
                .ok_or(ArgFailure::Overflow("sbt_index"))?;
            Ok(info)
        })
        .collect::<ArgResult<Vec<_>>>()?;

    Ok(ClusterBlob {
        kind: StructureKind::Cluster,
        cluster_id,
        cluster_flags: template.cluster_flags,
        position_truncate_bit_count: truncate_bits,
        positions,
        vertex_count: template.vertex_count,
        primitive_infos: pack_infos(&infos, limits)?,
        triangles: template.triangles,
    }
    .encode())
}

fn build_blas(
    memory: &dyn DeviceMemory,
    limits: &LimitsClusters,
    record: &[u8],
    within_total: bool,
) -> ArgResult<Vec<u8>> {
    let args = ClustersArgs::unpack(record)?;
    let count = args.cluster_handles_count;
    check_count("cluster_handles_count", count, limits.max_cluster_count_per_arg)?;
    if !within_total {
        return Err(ArgFailure::OverLimit {
            what: "total cluster count",
            count,
            limit: limits.max_total_cluster_count,
        });
    }
    if args.cluster_handles_buffer.is_null() {
        return Err(ArgFailure::NullBuffer("cluster_handles_buffer"));
    }

    let bytes = read_strided(
        memory,
        args.cluster_handles_buffer,
        count,
        args.effective_handle_stride(),
        8,
        "cluster_handles_buffer",
    )?;

    let mut clusters = Vec::with_capacity(count as usize);
    let mut bounds = None;
    let mut triangle_count = 0u32;
    for (k, chunk) in bytes.chunks_exact(8).enumerate() {
        let handle = Handle::from_raw(u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]));
        if !handle.is_valid() {
            return Err(ArgFailure::ZeroClusterHandle(k as u32));
        }
        let header = BlobHeader::read(memory, handle.address())
            .filter(|header| Some(StructureKind::Cluster) == header.kind())
            .ok_or(ArgFailure::WrongStructure(handle, StructureKind::Cluster))?;

        merge_bounds(&mut bounds, header.bounds);
        triangle_count = triangle_count.saturating_add(header.primitive_count);
        clusters.push(handle.raw());
    }

    Ok(BlasBlob {
        clusters,
        triangle_count,
        bounds: bounds.unwrap_or_default(),
    }
    .encode())
}

/// Decides, in argument order, which BLAS arguments fit the total cluster
/// budget. Arguments that fail on their own do not consume budget.
fn blas_budget(records: &[&[u8]], limits: &LimitsClusters) -> Vec<bool> {
    let mut total = 0u64;
    records
        .iter()
        .map(|record| match ClustersArgs::unpack(record) {
            Ok(args)
                if 0 != args.cluster_handles_count
                    && args.cluster_handles_count <= limits.max_cluster_count_per_arg =>
            {
                let next = total + u64::from(args.cluster_handles_count);
                let fits = next <= limits.max_total_cluster_count.into();
                if fits {
                    total = next;
                }
                fits
            }
            _ => true,
        })
        .collect()
}

fn build_one(
    memory: &dyn DeviceMemory,
    command: &BuildCommand,
    record: &[u8],
    within_total: bool,
) -> ArgResult<Vec<u8>> {
    match (&command.op, &command.limits) {
        (ClusterAccelBuildOp::ClasFromTriangles, Limits::Triangles(limits)) => {
            build_from_triangles(memory, limits, record, StructureKind::Cluster)
        }
        (ClusterAccelBuildOp::TemplatesFromTriangles, Limits::Triangles(limits)) => {
            build_from_triangles(memory, limits, record, StructureKind::Template)
        }
        (ClusterAccelBuildOp::ClasFromTemplates, Limits::Triangles(limits)) => {
            instantiate_template(memory, limits, record)
        }
        (ClusterAccelBuildOp::BlasFromClas, Limits::Clusters(limits)) => {
            build_blas(memory, limits, record, within_total)
        }
        (op, limits) => Err(ArgFailure::LimitsMismatch(*op, limits.family())),
    }
}

/// Outcome of one argument after placement.
#[derive(Clone, Copy, Default)]
struct Placed {
    handle: Handle,
    size: u32,
}

fn report(op: ClusterAccelBuildOp, index: usize, outcome: ArgResult<Placed>) -> Placed {
    match outcome {
        Ok(placed) => {
            log::trace!(
                "{op} argument {index}: {} ({} bytes)",
                placed.handle,
                placed.size
            );
            placed
        }
        Err(failure) => {
            log::warn!("{op} argument {index} not built: {failure}");
            Placed::default()
        }
    }
}

fn aligned_size(blob: &[u8], alignment: u64) -> ArgResult<u32> {
    align_up(blob.len() as u64, alignment)
        .and_then(|size| u32::try_from(size).ok())
        .ok_or(ArgFailure::Overflow("structure size"))
}

fn write_table(
    memory: &mut dyn DeviceMemory,
    table: DeviceAddress,
    stride: u32,
    entries: impl Iterator<Item = Vec<u8>>,
    what: &str,
) -> Result<()> {
    for (i, entry) in entries.enumerate() {
        let address = u64::from(stride)
            .checked_mul(i as u64)
            .and_then(|offset| table.offset(offset))
            .ok_or_else(|| Error::DeviceFault(format!("{what} address overflows")))?;
        memory
            .write(address, &entry)
            .map_err(|err| fault(what, err))?;
    }
    Ok(())
}

fn write_handles(
    memory: &mut dyn DeviceMemory,
    table: DeviceAddress,
    stride: u32,
    placed: &[Placed],
) -> Result<()> {
    write_table(
        memory,
        table,
        stride,
        placed.iter().map(|p| p.handle.raw().to_le_bytes().to_vec()),
        "output handles",
    )
}

fn write_sizes(
    memory: &mut dyn DeviceMemory,
    table: DeviceAddress,
    stride: u32,
    placed: &[Placed],
) -> Result<()> {
    if table.is_null() {
        return Ok(());
    }
    write_table(
        memory,
        table,
        stride,
        placed.iter().map(|p| p.size.to_le_bytes().to_vec()),
        "output sizes",
    )
}

fn place_implicit(
    memory: &mut dyn DeviceMemory,
    op: ClusterAccelBuildOp,
    params: &ImplicitBuildParams,
    blobs: Vec<ArgResult<Vec<u8>>>,
) -> Result<()> {
    let alignment = op.structure_alignment();
    let start = params.output_buffer.raw();
    let end = start
        .checked_add(params.output_buffer_size_in_bytes)
        .ok_or_else(|| Error::DeviceFault("output buffer range overflows".into()))?;

    let mut cursor = start;
    let mut placed = Vec::with_capacity(blobs.len());
    for (i, blob) in blobs.into_iter().enumerate() {
        let outcome = blob.and_then(|blob| {
            let size = aligned_size(&blob, alignment)?;
            let at = align_up(cursor, alignment).ok_or(ArgFailure::OutputFull)?;
            let next = at
                .checked_add(size.into())
                .filter(|&next| next <= end)
                .ok_or(ArgFailure::OutputFull)?;
            let address = DeviceAddress::new(at);
            memory
                .write(address, &blob)
                .map_err(|_| ArgFailure::Unwritable(address, blob.len()))?;
            cursor = next;
            Ok(Placed {
                handle: address.into(),
                size,
            })
        });
        placed.push(report(op, i, outcome));
    }

    write_handles(
        memory,
        params.output_handles_buffer,
        params.output_handles_stride_in_bytes,
        &placed,
    )?;
    write_sizes(
        memory,
        params.output_sizes_buffer,
        params.output_sizes_stride_in_bytes,
        &placed,
    )
}

fn place_explicit(
    memory: &mut dyn DeviceMemory,
    op: ClusterAccelBuildOp,
    params: &ExplicitDestinationsParams,
    blobs: Vec<ArgResult<Vec<u8>>>,
) -> Result<()> {
    let alignment = op.structure_alignment();
    let mut placed = Vec::with_capacity(blobs.len());
    for (i, blob) in blobs.into_iter().enumerate() {
        let slot = u64::from(params.dest_addresses_stride_in_bytes)
            .checked_mul(i as u64)
            .and_then(|offset| params.dest_addresses_buffer.offset(offset))
            .ok_or_else(|| Error::DeviceFault("destination table address overflows".into()))?;
        let dest = DeviceAddress::new(
            memory
                .read_u64(slot)
                .map_err(|err| fault("destination table", err))?,
        );

        let outcome = blob.and_then(|blob| {
            if dest.is_null() {
                return Err(ArgFailure::NullBuffer("destination address"));
            }
            if 0 != dest.raw() % alignment {
                return Err(ArgFailure::MisalignedDestination(dest, alignment));
            }
            let size = aligned_size(&blob, alignment)?;
            memory
                .write(dest, &blob)
                .map_err(|_| ArgFailure::Unwritable(dest, blob.len()))?;
            Ok(Placed {
                handle: dest.into(),
                size,
            })
        });
        placed.push(report(op, i, outcome));
    }

    // Without a handles buffer the destination table doubles as the handle
    // record.
    if params.output_handles_buffer.is_null() {
        write_handles(
            memory,
            params.dest_addresses_buffer,
            params.dest_addresses_stride_in_bytes,
            &placed,
        )?;
    } else {
        write_handles(
            memory,
            params.output_handles_buffer,
            params.output_handles_stride_in_bytes,
            &placed,
        )?;
    }
    write_sizes(
        memory,
        params.output_sizes_buffer,
        params.output_sizes_stride_in_bytes,
        &placed,
    )
}

fn place_get_sizes(
    memory: &mut dyn DeviceMemory,
    op: ClusterAccelBuildOp,
    params: &GetSizesParams,
    blobs: Vec<ArgResult<Vec<u8>>>,
) -> Result<()> {
    let alignment = op.structure_alignment();
    let placed = blobs
        .into_iter()
        .enumerate()
        .map(|(i, blob)| {
            let outcome = blob.and_then(|blob| {
                Ok(Placed {
                    handle: Handle::NULL,
                    size: aligned_size(&blob, alignment)?,
                })
            });
            report(op, i, outcome)
        })
        .collect::<Vec<_>>();

    write_sizes(
        memory,
        params.output_sizes_buffer,
        params.output_sizes_stride_in_bytes,
        &placed,
    )
}

/// Runs one build command.
///
/// Unreadable argument records and unwritable handle or size tables fail the
/// whole command. Everything that concerns one argument only is reported as
/// a zero handle and zero size for that argument.
pub(super) fn execute(memory: &mut dyn DeviceMemory, command: &BuildCommand) -> Result<()> {
    let op = command.op;
    log::debug!(
        "Executing {op} ({} mode) over {} argument(s) at {}",
        command.mode,
        command.arg_count,
        command.args_buffer
    );

    let span = command
        .args_span()
        .ok_or_else(|| Error::DeviceFault("argument range overflows".into()))?;
    let args = memory
        .read_vec(command.args_buffer, span)
        .map_err(|err| fault("argument records", err))?;

    let stride = usize::try_from(command.args_stride_in_bytes)
        .map_err(|_| Error::DeviceFault("argument stride overflows".into()))?;
    let records = (0..command.arg_count as usize)
        .map(|i| &args[i * stride..])
        .collect::<Vec<_>>();
    let budget = match &command.limits {
        Limits::Clusters(limits) if ClusterAccelBuildOp::BlasFromClas == op => {
            blas_budget(&records, limits)
        }
        _ => vec![true; records.len()],
    };

    let blobs: Vec<ArgResult<Vec<u8>>> = {
        let memory: &dyn DeviceMemory = &*memory;
        let build = |i: usize| build_one(memory, command, records[i], budget[i]);

        #[cfg(feature = "rayon")]
        let blobs = (0..records.len()).into_par_iter().map(build).collect();
        #[cfg(not(feature = "rayon"))]
        let blobs = (0..records.len()).map(build).collect();
        blobs
    };

    match &command.mode {
        BuildMode::Implicit(params) => place_implicit(memory, op, params, blobs),
        BuildMode::ExplicitDestinations(params) => place_explicit(memory, op, params, blobs),
        BuildMode::GetSizes(params) => place_get_sizes(memory, op, params, blobs),
    }
}

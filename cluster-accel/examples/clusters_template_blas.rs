//! Builds a BLAS out of template-instanced clusters.
//!
//! A height field grid is cut into strips that share one topology. The
//! topology is built once as a cluster template, every strip instantiates it
//! with its own positions, and the resulting clusters are gathered into a
//! single BLAS.
//!
//! Run with `RUST_LOG=debug` to see what the device does.
use cluster_accel::abi::{
    pack_records, ArgsRecord, ClustersArgs, IndicesFormat, TemplatesArgs, TrianglesArgs,
};
use cluster_accel::*;
use glam::Vec3;

const STRIP_QUADS: u32 = 8;
const STRIPS: u32 = 2;

fn build(
    device: &Device,
    label: &str,
    desc: &ClusterAccelBuildDesc,
) -> anyhow::Result<(Buffer, HandleReport)> {
    let sizes = device.get_cluster_acceleration_structure_sizes(desc)?;
    println!(
        "{label}: {} result bytes, {} scratch bytes",
        sizes.result_size, sizes.scratch_size
    );

    let result = device.create_buffer(BufferDesc::new(
        label,
        BufferUsage::ACCELERATION_STRUCTURE,
        sizes.result_size,
    ))?;
    let scratch = device.create_buffer(BufferDesc::new(
        "scratch",
        BufferUsage::SCRATCH,
        sizes.scratch_size,
    ))?;

    let mut encoder = device.create_command_encoder();
    encoder.build_cluster_acceleration_structure_into(
        desc,
        BufferOffsetPair::from(&scratch),
        BufferOffsetPair::from(&result),
    )?;
    device.submit_command_buffer(encoder.finish());
    device.wait()?;

    let handles = device.read_handles(&result, 0, desc.arg_count as _)?;
    Ok((result, handles))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let device = Device::new(DeviceOptions::default())?;

    // Two rows of vertices per strip, quads split along the diagonal.
    let vertex_count = 2 * (STRIP_QUADS + 1);
    let triangle_count = 2 * STRIP_QUADS;
    let indices = (0..STRIP_QUADS as u8)
        .flat_map(|q| {
            let (a, b, c, d) = (2 * q, 2 * q + 1, 2 * q + 2, 2 * q + 3);
            [a, c, b, b, c, d]
        })
        .collect::<Vec<_>>();

    let positions = (0..STRIPS)
        .flat_map(|strip| {
            (0..=STRIP_QUADS).flat_map(move |x| {
                [strip, strip + 1].map(|z| {
                    let (x, z) = (x as f32, z as f32);
                    Vec3::new(x, (0.3 * x).sin() * (0.5 * z).cos(), z)
                })
            })
        })
        .collect::<Vec<_>>();

    let index_buffer = device.create_buffer(BufferDesc::with_data(
        "strip-indices",
        BufferUsage::BUILD_INPUT,
        &indices,
    ))?;
    let vertex_buffer = device.create_buffer(BufferDesc::with_data(
        "strip-vertices",
        BufferUsage::BUILD_INPUT,
        bytemuck::cast_slice(&positions),
    ))?;

    let limits = LimitsTriangles {
        max_arg_count: 1,
        max_triangle_count_per_arg: triangle_count,
        max_vertex_count_per_arg: vertex_count,
        max_unique_sbt_index_count_per_arg: 1,
        position_truncate_bit_count: 0,
    };

    // The template only needs the topology.
    let template_args = TrianglesArgs {
        triangle_count,
        vertex_count,
        index_format: IndicesFormat::Bits8,
        index_buffer: index_buffer.device_address(),
        ..Default::default()
    };
    let template_args = device.create_buffer(BufferDesc::with_data(
        "template-args",
        BufferUsage::BUILD_INPUT,
        &template_args.to_bytes()?,
    ))?;
    let (_templates, template) = build(
        &device,
        "template",
        &ClusterAccelBuildDesc::templates_from_triangles(limits).with_args(
            template_args.device_address(),
            TrianglesArgs::SIZE,
            1,
        ),
    )?;
    anyhow::ensure!(template.all_built(), "template build failed");

    // One instance per strip.
    let instances = (0..STRIPS)
        .map(|strip| {
            let vertices = vertex_buffer
                .device_address()
                .offset(u64::from(strip * vertex_count) * 12)
                .ok_or_else(|| anyhow::anyhow!("vertex address overflows"))?;
            Ok(TemplatesArgs::new(template[0], vertices, 12, strip, 0))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let instance_args = device.create_buffer(BufferDesc::with_data(
        "instance-args",
        BufferUsage::BUILD_INPUT,
        &pack_records(&instances, 0)?,
    ))?;
    let (clusters, cluster_handles) = build(
        &device,
        "clusters",
        &ClusterAccelBuildDesc::clas_from_templates(LimitsTriangles {
            max_arg_count: STRIPS,
            ..limits
        })
        .with_args(instance_args.device_address(), TemplatesArgs::SIZE, STRIPS),
    )?;
    anyhow::ensure!(
        cluster_handles.all_built(),
        "clusters {:?} failed",
        cluster_handles.failed().collect::<Vec<_>>()
    );

    // The handle table at the head of the cluster result is the BLAS input.
    let blas_args = device.create_buffer(BufferDesc::with_data(
        "blas-args",
        BufferUsage::BUILD_INPUT,
        &ClustersArgs::new(STRIPS, clusters.device_address(), 0).to_bytes()?,
    ))?;
    let (_blas, blas) = build(
        &device,
        "blas",
        &ClusterAccelBuildDesc::blas_from_clas(LimitsClusters {
            max_arg_count: 1,
            max_total_cluster_count: STRIPS,
            max_cluster_count_per_arg: STRIPS,
        })
        .with_args(blas_args.device_address(), ClustersArgs::SIZE, 1),
    )?;
    anyhow::ensure!(blas.all_built(), "BLAS build failed");

    for handle in cluster_handles.handles().iter().chain(blas.handles()) {
        if let Some(info) = device.inspect_structure(*handle)? {
            println!(
                "{handle}: {} #{} with {} primitives, {} bytes, bounds {:?}",
                info.kind, info.cluster_id, info.primitive_count, info.size_in_bytes, info.bounds
            );
        }
    }

    Ok(())
}

//! Implicit, explicit-destination and size-only builds.

use cluster_accel::abi::{pack_records, ArgsRecord, IndicesFormat, TrianglesArgs};
use cluster_accel::{
    ClusterAccelBuildDesc, DeviceAddress, ExplicitDestinationsParams, GetSizesParams, Handle,
    ImplicitBuildParams,
};
use test_utils::*;

// 64 byte header, 3 positions, one primitive info and one index triple,
// rounded up to the 128 byte cluster alignment.
const ONE_TRIANGLE_CLAS_SIZE: u32 = 128;

#[test]
fn implicit_with_separate_tables() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 3)?;
    let sizes = device.get_cluster_acceleration_structure_sizes(&clusters.desc())?;

    let output = zeroed(&device, "output", sizes.storage_size(clusters.desc().limits()))?;
    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;
    // 16 byte handle stride, 8 byte size stride.
    let handles = zeroed(&device, "handles", 3 * 16)?;
    let size_table = zeroed(&device, "sizes", 3 * 8)?;

    let desc = clusters.desc().with_mode(ImplicitBuildParams {
        output_buffer: output.device_address(),
        temp_buffer: scratch.device_address(),
        output_handles_buffer: handles.device_address(),
        output_handles_stride_in_bytes: 16,
        output_sizes_buffer: size_table.device_address(),
        output_sizes_stride_in_bytes: 8,
        ..Default::default()
    });

    let mut encoder = device.create_command_encoder();
    encoder.build_cluster_acceleration_structure(&desc)?;
    device.submit_command_buffer(encoder.finish());
    device.wait()?;

    let report = device.read_handles_strided(&handles, 0, 3, 16)?;
    assert!(report.all_built());
    assert_eq!(report[0].address(), output.device_address());

    let mut placed = Vec::new();
    for i in 0..3u64 {
        let mut size = [0u8; 4];
        device.read_buffer_data(&size_table, &mut size, 8 * i)?;
        placed.push(u32::from_le_bytes(size));
    }
    assert_eq!(placed, vec![ONE_TRIANGLE_CLAS_SIZE; 3]);

    // Structures are laid out back to back.
    for (i, handle) in report.handles().iter().enumerate() {
        let expected = output
            .device_address()
            .offset(i as u64 * u64::from(ONE_TRIANGLE_CLAS_SIZE))
            .expect("in range");
        assert_eq!(handle.address(), expected);
    }
    Ok(())
}

#[test]
fn get_sizes_writes_sizes_only() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 2)?;
    let sizes = device.get_cluster_acceleration_structure_sizes(&clusters.desc())?;

    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;
    let size_table = zeroed(&device, "sizes", 2 * 4)?;
    let desc = clusters.desc().with_mode(GetSizesParams {
        temp_buffer: scratch.device_address(),
        output_sizes_buffer: size_table.device_address(),
        ..Default::default()
    });

    let mut encoder = device.create_command_encoder();
    encoder.build_cluster_acceleration_structure(&desc)?;
    device.submit_command_buffer(encoder.finish());
    device.wait()?;

    let per_arg = device.read_sizes(&size_table, 0, 2)?;
    assert_eq!(per_arg, vec![ONE_TRIANGLE_CLAS_SIZE; 2]);
    assert!(per_arg
        .iter()
        .all(|&size| u64::from(size) <= sizes.storage_size(clusters.desc().limits())));
    Ok(())
}

#[test]
fn get_sizes_reports_zero_for_failing_argument() -> anyhow::Result<()> {
    let device = device()?;
    let (vertices, _) = triangle_soup(1);
    let vertex_buffer = upload(&device, "vertices", bytemuck::cast_slice(&vertices))?;
    let indices = upload(&device, "indices", bytemuck::cast_slice(&[0u32, 1, 2, 0, 1, 3]))?;

    let records = (0..2u64)
        .map(|i| {
            TrianglesArgs::new(
                i as u32,
                1,
                3,
                indices.device_address().offset(12 * i).expect("in range"),
                vertex_buffer.device_address(),
                0,
                IndicesFormat::Bits32,
            )
        })
        .collect::<Vec<_>>();
    let args = upload(&device, "args", &pack_records(&records, 0)?)?;

    let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(2, 1, 3)).with_args(
        args.device_address(),
        TrianglesArgs::SIZE,
        2,
    );
    let sizes = device.get_cluster_acceleration_structure_sizes(&desc)?;
    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;
    let size_table = zeroed(&device, "sizes", 8)?;

    let mut encoder = device.create_command_encoder();
    encoder.build_cluster_acceleration_structure(&desc.with_mode(GetSizesParams {
        temp_buffer: scratch.device_address(),
        output_sizes_buffer: size_table.device_address(),
        ..Default::default()
    }))?;
    device.submit_command_buffer(encoder.finish());
    device.wait()?;

    assert_eq!(
        device.read_sizes(&size_table, 0, 2)?,
        vec![ONE_TRIANGLE_CLAS_SIZE, 0]
    );
    Ok(())
}

/// Places each structure at an address chosen by the caller.
fn explicit_build(with_handles_buffer: bool) -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 2)?;
    let sizes = device.get_cluster_acceleration_structure_sizes(&clusters.desc())?;

    let storage = zeroed(&device, "storage", 4 * u64::from(ONE_TRIANGLE_CLAS_SIZE))?;
    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;

    // Reverse order, with a gap.
    let destinations = [
        storage.device_address().offset(3 * 128).expect("in range"),
        storage.device_address().offset(128).expect("in range"),
    ];
    let dest_table = upload(
        &device,
        "destinations",
        bytemuck::cast_slice(&destinations.map(DeviceAddress::raw)),
    )?;
    let handles = zeroed(&device, "handles", 16)?;

    let desc = clusters.desc().with_mode(ExplicitDestinationsParams {
        temp_buffer: scratch.device_address(),
        dest_addresses_buffer: dest_table.device_address(),
        output_handles_buffer: if with_handles_buffer {
            handles.device_address()
        } else {
            DeviceAddress::NULL
        },
        ..Default::default()
    });

    let mut encoder = device.create_command_encoder();
    encoder.build_cluster_acceleration_structure(&desc)?;
    device.submit_command_buffer(encoder.finish());
    device.wait()?;

    let report = if with_handles_buffer {
        device.read_handles(&handles, 0, 2)?
    } else {
        device.read_handles(&dest_table, 0, 2)?
    };
    assert_eq!(
        report.handles(),
        &destinations.map(Handle::from)[..],
        "handles are the destination addresses"
    );

    let info = device.inspect_structure(report[0])?.expect("CLAS info");
    assert_eq!(info.cluster_id, 0);
    let info = device.inspect_structure(report[1])?.expect("CLAS info");
    assert_eq!(info.cluster_id, 1);
    Ok(())
}

#[test]
fn explicit_destinations_with_handles_buffer() -> anyhow::Result<()> {
    explicit_build(true)
}

#[test]
fn explicit_destinations_overwrite_destination_table() -> anyhow::Result<()> {
    explicit_build(false)
}

#[test]
fn misaligned_destination_fails_that_argument() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 2)?;
    let sizes = device.get_cluster_acceleration_structure_sizes(&clusters.desc())?;

    let storage = zeroed(&device, "storage", 1024)?;
    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;
    let destinations = [
        storage.device_address().raw() + 8,
        storage.device_address().raw() + 512,
    ];
    let dest_table = upload(&device, "destinations", bytemuck::cast_slice(&destinations))?;

    let mut encoder = device.create_command_encoder();
    encoder.build_cluster_acceleration_structure(&clusters.desc().with_mode(
        ExplicitDestinationsParams {
            temp_buffer: scratch.device_address(),
            dest_addresses_buffer: dest_table.device_address(),
            ..Default::default()
        },
    ))?;
    device.submit_command_buffer(encoder.finish());
    device.wait()?;

    let report = device.read_handles(&dest_table, 0, 2)?;
    assert_eq!(report.failed().collect::<Vec<_>>(), vec![0]);
    assert_eq!(report[1].raw(), destinations[1]);
    Ok(())
}

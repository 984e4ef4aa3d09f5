//! Sizing and recording errors. None of these reach the device.

use cluster_accel::abi::{ArgsRecord, ClustersArgs, TrianglesArgs};
use cluster_accel::{
    BufferOffsetPair, ClusterAccelBuildDesc, Device, DeviceOptions, Error, Feature, Limits,
    LimitsClusters, LimitsTriangles, ValidationError, ValidationRule,
};
use test_utils::*;

fn validation_rule(err: &Error) -> Option<ValidationRule> {
    match err {
        Error::DescriptorInvalid(err) => Some(err.rule()),
        _ => None,
    }
}

#[test]
fn sizes_are_idempotent_and_monotone() -> anyhow::Result<()> {
    let device = device()?;

    let small = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(4, 8, 16));
    let large = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(4, 64, 128));

    let first = device.get_cluster_acceleration_structure_sizes(&small)?;
    assert_eq!(first, device.get_cluster_acceleration_structure_sizes(&small)?);

    let bigger = device.get_cluster_acceleration_structure_sizes(&large)?;
    assert!(bigger.result_size > first.result_size);
    assert!(bigger.scratch_size >= first.scratch_size);
    Ok(())
}

#[test]
fn sizes_ignore_args_and_mode() -> anyhow::Result<()> {
    let device = device()?;
    let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(2, 1, 3));

    // No args buffer, no mode buffers: sizing only looks at op and limits.
    let bare = device.get_cluster_acceleration_structure_sizes(&desc)?;
    let clusters = TriangleClusters::new(&device, 2)?;
    assert_eq!(
        bare,
        device.get_cluster_acceleration_structure_sizes(&clusters.desc())?
    );
    Ok(())
}

#[test]
fn clas_with_cluster_limits_fails_sizes() -> anyhow::Result<()> {
    let err = ClusterAccelBuildDesc::from_raw(
        0,
        Limits::Clusters(LimitsClusters {
            max_arg_count: 1,
            max_total_cluster_count: 1,
            max_cluster_count_per_arg: 1,
        }),
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::LimitsFamilyMismatch { .. }));
    assert_eq!(err.rule(), ValidationRule::Op);
    Ok(())
}

#[test]
fn unknown_op_is_rejected() {
    let err = ClusterAccelBuildDesc::from_raw(7, LimitsTriangles::default().into()).unwrap_err();
    assert_eq!(err, ValidationError::UnknownOp(7));
}

#[test]
fn clas_zero_required_limits_fail_sizes() -> anyhow::Result<()> {
    let device = device()?;

    for limits in [
        triangle_limits(0, 1, 3),
        triangle_limits(1, 0, 3),
        triangle_limits(1, 1, 0),
        LimitsTriangles {
            max_unique_sbt_index_count_per_arg: 0,
            ..triangle_limits(1, 1, 3)
        },
    ] {
        let err = device
            .get_cluster_acceleration_structure_sizes(&ClusterAccelBuildDesc::clas_from_triangles(
                limits,
            ))
            .unwrap_err();
        assert_eq!(validation_rule(&err), Some(ValidationRule::Limits), "{err}");
    }
    Ok(())
}

#[test]
fn blas_zero_required_limits_fail_sizes() -> anyhow::Result<()> {
    let device = device()?;
    let desc = ClusterAccelBuildDesc::blas_from_clas(LimitsClusters {
        max_arg_count: 1,
        max_total_cluster_count: 0,
        max_cluster_count_per_arg: 1,
    });

    let err = device
        .get_cluster_acceleration_structure_sizes(&desc)
        .unwrap_err();
    match err {
        Error::DescriptorInvalid(err) => assert_eq!(err.field(), "max_total_cluster_count"),
        other => panic!("unexpected {other}"),
    }
    Ok(())
}

#[test]
fn limits_beyond_backend_capabilities_fail_sizes() -> anyhow::Result<()> {
    let device = device()?;
    let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(1, 100_000, 3));

    let err = device
        .get_cluster_acceleration_structure_sizes(&desc)
        .unwrap_err();
    assert!(matches!(err, Error::SizingFailure { .. }), "{err}");
    Ok(())
}

#[test]
fn failed_sizes_are_retried() -> anyhow::Result<()> {
    let device = device()?;
    let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(1, 100_000, 3));

    assert!(device.get_cluster_acceleration_structure_sizes(&desc).is_err());
    assert!(device.get_cluster_acceleration_structure_sizes(&desc).is_err());
    Ok(())
}

#[test]
fn bad_args_fields_fail_build() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 1)?;
    let scratch = zeroed(&device, "scratch", 128)?;
    let result = zeroed(&device, "result", 128)?;

    let mut bad = Vec::new();
    let mut null_args = clusters.desc();
    null_args.args_buffer = Default::default();
    bad.push(null_args);
    let mut no_args = clusters.desc();
    no_args.arg_count = 0;
    bad.push(no_args);
    let mut no_stride = clusters.desc();
    no_stride.args_stride_in_bytes = 0;
    bad.push(no_stride);

    for desc in bad {
        let mut encoder = device.create_command_encoder();
        let err = encoder
            .build_cluster_acceleration_structure_into(
                &desc,
                BufferOffsetPair::from(&scratch),
                BufferOffsetPair::from(&result),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BuildCommandInvalid(_)), "{err}");
        assert!(encoder.finish().is_empty());
    }
    Ok(())
}

#[test]
fn descriptor_rules_apply_at_recording() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 2)?;

    // Two arguments against a limit of one.
    let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(1, 1, 3)).with_args(
        clusters.args.device_address(),
        TrianglesArgs::SIZE,
        2,
    );
    let err = device
        .create_command_encoder()
        .build_cluster_acceleration_structure(&desc)
        .unwrap_err();
    assert_eq!(validation_rule(&err), Some(ValidationRule::ArgCount));

    // A stride shorter than one record.
    let desc = clusters.desc().with_args(clusters.args.device_address(), 64, 2);
    let err = device
        .create_command_encoder()
        .build_cluster_acceleration_structure(&desc)
        .unwrap_err();
    assert_eq!(validation_rule(&err), Some(ValidationRule::ArgsBuffer));

    // Implicit mode without any output buffers.
    let err = device
        .create_command_encoder()
        .build_cluster_acceleration_structure(&clusters.desc())
        .unwrap_err();
    assert_eq!(validation_rule(&err), Some(ValidationRule::ModeParams));
    Ok(())
}

#[test]
fn undersized_buffers_fail_build() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 2)?;
    let desc = clusters.desc();
    let sizes = device.get_cluster_acceleration_structure_sizes(&desc)?;

    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;
    let result = zeroed(&device, "result", sizes.result_size)?;
    let short_scratch = zeroed(&device, "short-scratch", sizes.scratch_size - 1)?;
    let short_result = zeroed(&device, "short-result", sizes.result_size - 1)?;
    // Only the table fits.
    let table_only = zeroed(&device, "table-only", 128)?;

    for (scratch, result) in [
        (&short_scratch, &result),
        (&scratch, &short_result),
        (&scratch, &table_only),
    ] {
        let err = device
            .create_command_encoder()
            .build_cluster_acceleration_structure_into(
                &desc,
                BufferOffsetPair::from(scratch),
                BufferOffsetPair::from(result),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BuildCommandInvalid(_)), "{err}");
    }
    Ok(())
}

#[test]
fn args_buffer_must_hold_every_record() -> anyhow::Result<()> {
    let device = device()?;
    let clusters = TriangleClusters::new(&device, 1)?;

    // One record in the buffer, two claimed.
    let desc = ClusterAccelBuildDesc::clas_from_triangles(triangle_limits(2, 1, 3)).with_args(
        clusters.args.device_address(),
        TrianglesArgs::SIZE,
        2,
    );
    let sizes = device.get_cluster_acceleration_structure_sizes(&desc)?;
    let scratch = zeroed(&device, "scratch", sizes.scratch_size)?;
    let result = zeroed(&device, "result", sizes.result_size)?;

    let err = device
        .create_command_encoder()
        .build_cluster_acceleration_structure_into(
            &desc,
            BufferOffsetPair::from(&scratch),
            BufferOffsetPair::from(&result),
        )
        .unwrap_err();
    assert!(matches!(err, Error::BuildCommandInvalid(_)), "{err}");
    Ok(())
}

#[test]
fn missing_feature_is_reported() -> anyhow::Result<()> {
    init_logging();
    let device = Device::new(DeviceOptions {
        features: vec![Feature::RayTracing],
        ..Default::default()
    })?;
    assert!(!device.has_feature(Feature::ClusterAccelerationStructure));

    let args = upload(
        &device,
        "blas-args",
        &ClustersArgs::new(1, Default::default(), 0).to_bytes()?,
    )?;
    let desc = ClusterAccelBuildDesc::blas_from_clas(LimitsClusters {
        max_arg_count: 1,
        max_total_cluster_count: 1,
        max_cluster_count_per_arg: 1,
    })
    .with_args(args.device_address(), ClustersArgs::SIZE, 1);

    let err = device
        .get_cluster_acceleration_structure_sizes(&desc)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::FeatureNotAvailable(Feature::ClusterAccelerationStructure)
    ));

    let scratch = zeroed(&device, "scratch", 4096)?;
    let result = zeroed(&device, "result", 4096)?;
    let err = device
        .create_command_encoder()
        .build_cluster_acceleration_structure_into(
            &desc,
            BufferOffsetPair::from(&scratch),
            BufferOffsetPair::from(&result),
        )
        .unwrap_err();
    assert!(matches!(err, Error::FeatureNotAvailable(_)));
    Ok(())
}

#[test]
fn ray_tracing_is_required_too() -> anyhow::Result<()> {
    init_logging();
    let device = Device::new(DeviceOptions {
        features: vec![Feature::ClusterAccelerationStructure],
        ..Default::default()
    })?;
    let clusters = TriangleClusters::new(&device, 1)?;

    let err = device
        .get_cluster_acceleration_structure_sizes(&clusters.desc())
        .unwrap_err();
    assert!(matches!(err, Error::FeatureNotAvailable(Feature::RayTracing)));

    let scratch = zeroed(&device, "scratch", 4096)?;
    let result = zeroed(&device, "result", 4096)?;
    let err = device
        .create_command_encoder()
        .build_cluster_acceleration_structure_into(
            &clusters.desc(),
            BufferOffsetPair::from(&scratch),
            BufferOffsetPair::from(&result),
        )
        .unwrap_err();
    assert!(matches!(err, Error::FeatureNotAvailable(Feature::RayTracing)));
    Ok(())
}

#[test]
fn device_rejects_small_address_alignment() {
    let err = Device::new(DeviceOptions {
        address_alignment: 64,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, Error::InvalidBufferSize { .. }));
}

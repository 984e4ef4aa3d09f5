use super::blob::HEADER_SIZE;
use crate::backend::BackendCapabilities;
use crate::desc::{ClusterAccelBuildOp, Limits, LimitsClusters, LimitsTriangles};
use crate::error::{Error, Result};
use crate::sizes::ClusterAccelSizes;
use crate::align_up;
use cluster_accel_sys as sys;

/// Bytes of a cluster or template blob: header, positions, primitive infos
/// and index triples.
pub(super) fn cluster_bytes(vertex_count: u64, triangle_count: u64) -> Option<u64> {
    let positions = vertex_count.checked_mul(12)?;
    let topology = triangle_count.checked_mul(4 + 12)?;
    HEADER_SIZE.checked_add(positions)?.checked_add(topology)
}

pub(super) fn blas_bytes(cluster_count: u64) -> Option<u64> {
    HEADER_SIZE.checked_add(cluster_count.checked_mul(8)?)
}

fn failure(op: ClusterAccelBuildOp, reason: String) -> Error {
    Error::SizingFailure { op, reason }
}

fn check_capability(
    op: ClusterAccelBuildOp,
    field: &str,
    value: u32,
    maximum: u32,
) -> Result<()> {
    if value > maximum {
        Err(failure(
            op,
            format!("`{field}` {value} exceeds the backend maximum {maximum}"),
        ))
    } else {
        Ok(())
    }
}

fn triangles_sizes(
    caps: &BackendCapabilities,
    op: ClusterAccelBuildOp,
    limits: &LimitsTriangles,
) -> Result<Option<ClusterAccelSizes>> {
    check_capability(
        op,
        "max_triangle_count_per_arg",
        limits.max_triangle_count_per_arg,
        caps.max_triangles_per_cluster,
    )?;
    check_capability(
        op,
        "max_vertex_count_per_arg",
        limits.max_vertex_count_per_arg,
        caps.max_vertices_per_cluster,
    )?;
    check_capability(
        op,
        "position_truncate_bit_count",
        limits.position_truncate_bit_count,
        caps.max_position_truncate_bit_count,
    )?;

    let alignment = op.structure_alignment();
    let args = u64::from(limits.max_arg_count);
    let triangles = u64::from(limits.max_triangle_count_per_arg);
    let vertices = u64::from(limits.max_vertex_count_per_arg);

    let Some(per_arg) = cluster_bytes(vertices, triangles).and_then(|b| align_up(b, alignment))
    else {
        return Ok(None);
    };
    // Slack so the first structure fits behind an unaligned output address.
    let result_size = per_arg
        .checked_mul(args)
        .and_then(|bytes| bytes.checked_add(alignment - 1));

    // Staging for the decoded positions and indices of every argument.
    let scratch_size = triangles
        .checked_mul(12)
        .and_then(|t| vertices.checked_mul(16).and_then(|v| t.checked_add(v)))
        .and_then(|per_arg| per_arg.checked_mul(args))
        .and_then(|bytes| bytes.checked_add(sys::ACCEL_BUFFER_BYTE_ALIGNMENT))
        .and_then(|bytes| align_up(bytes, sys::ACCEL_BUFFER_BYTE_ALIGNMENT));

    Ok(result_size
        .zip(scratch_size)
        .map(|(result_size, scratch_size)| ClusterAccelSizes {
            result_size,
            scratch_size,
        }))
}

fn clusters_sizes(
    caps: &BackendCapabilities,
    op: ClusterAccelBuildOp,
    limits: &LimitsClusters,
) -> Result<Option<ClusterAccelSizes>> {
    check_capability(
        op,
        "max_cluster_count_per_arg",
        limits.max_cluster_count_per_arg,
        caps.max_clusters_per_blas,
    )?;

    let alignment = op.structure_alignment();
    let args = u64::from(limits.max_arg_count);
    let total = u64::from(limits.max_total_cluster_count);
    let per_arg_clusters = u64::from(limits.max_cluster_count_per_arg).min(total);

    let Some(per_arg) = blas_bytes(per_arg_clusters).and_then(|b| align_up(b, alignment)) else {
        return Ok(None);
    };
    let result_size = per_arg
        .checked_mul(args)
        .and_then(|bytes| bytes.checked_add(alignment - 1));

    let scratch_size = args
        .checked_mul(16)
        .and_then(|a| total.checked_mul(8).and_then(|t| a.checked_add(t)))
        .and_then(|bytes| bytes.checked_add(sys::ACCEL_BUFFER_BYTE_ALIGNMENT))
        .and_then(|bytes| align_up(bytes, sys::ACCEL_BUFFER_BYTE_ALIGNMENT));

    Ok(result_size
        .zip(scratch_size)
        .map(|(result_size, scratch_size)| ClusterAccelSizes {
            result_size,
            scratch_size,
        }))
}

/// Structure storage and scratch for `op` under `limits`.
pub(super) fn sizes(
    caps: &BackendCapabilities,
    op: ClusterAccelBuildOp,
    limits: &Limits,
) -> Result<ClusterAccelSizes> {
    let sizes = match limits {
        Limits::Triangles(limits) => triangles_sizes(caps, op, limits)?,
        Limits::Clusters(limits) => clusters_sizes(caps, op, limits)?,
    }
    .ok_or_else(|| failure(op, "size overflows u64".into()))?;

    let largest = sizes.result_size.max(sizes.scratch_size);
    if largest > caps.max_structure_bytes {
        return Err(failure(
            op,
            format!(
                "{largest} bytes exceed the backend maximum of {} bytes",
                caps.max_structure_bytes
            ),
        ));
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_triangles: u32, max_vertices: u32) -> Limits {
        LimitsTriangles {
            max_arg_count: 1,
            max_triangle_count_per_arg: max_triangles,
            max_vertex_count_per_arg: max_vertices,
            max_unique_sbt_index_count_per_arg: 1,
            position_truncate_bit_count: 0,
        }
        .into()
    }

    #[test]
    fn clas_storage_is_clas_aligned() {
        let caps = BackendCapabilities::default();
        let sizes = sizes(&caps, ClusterAccelBuildOp::ClasFromTriangles, &limits(2, 4)).unwrap();
        // 64 + 4 * 12 + 2 * 16 = 144, rounded to 256, plus slack.
        assert_eq!(sizes.result_size, 256 + 127);
    }

    #[test]
    fn rejects_limits_beyond_capabilities() {
        let caps = BackendCapabilities::default();
        for op in [
            ClusterAccelBuildOp::ClasFromTriangles,
            ClusterAccelBuildOp::TemplatesFromTriangles,
            ClusterAccelBuildOp::ClasFromTemplates,
        ] {
            assert!(matches!(
                sizes(&caps, op, &limits(257, 3)),
                Err(Error::SizingFailure { .. })
            ));
        }
    }

    #[test]
    fn rejects_sizes_beyond_max_structure_bytes() {
        let caps = BackendCapabilities {
            max_structure_bytes: 1024,
            ..Default::default()
        };
        let limits = Limits::Clusters(LimitsClusters {
            max_arg_count: 64,
            max_total_cluster_count: 1024,
            max_cluster_count_per_arg: 16,
        });
        assert!(matches!(
            sizes(&caps, ClusterAccelBuildOp::BlasFromClas, &limits),
            Err(Error::SizingFailure { .. })
        ));
    }
}

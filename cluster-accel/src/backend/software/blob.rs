//! In-memory format of the structures the software backend builds.
//!
//! Every structure starts with a 64 byte [`BlobHeader`]. Clusters and
//! templates continue with `vertex_count` positions (templates built without
//! positions have none), `primitive_count` packed primitive infos and
//! `primitive_count` index triples. A BLAS continues with the handles of its
//! clusters.
//!
//! The format is private to the backend and only ever read back by it.
use crate::backend::{DeviceMemory, StructureInfo, StructureKind};
use crate::DeviceAddress;
use bytemuck::{Pod, Zeroable};

pub(super) const BLOB_MAGIC: u32 = u32::from_le_bytes(*b"SWCA");
pub(super) const HEADER_SIZE: u64 = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub(super) struct BlobHeader {
    pub magic: u32,
    pub kind: u32,
    pub cluster_id: u32,
    pub primitive_count: u32,
    pub vertex_count: u32,
    pub cluster_flags: u32,
    pub payload_bytes: u32,
    pub position_truncate_bit_count: u32,
    pub bounds: [f32; 6],
    pub has_positions: u32,
    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<BlobHeader>() == HEADER_SIZE as usize);

impl BlobHeader {
    pub fn kind(&self) -> Option<StructureKind> {
        StructureKind::try_from(self.kind).ok()
    }

    /// Reads and checks the header of the structure at `address`.
    pub fn read(memory: &dyn DeviceMemory, address: DeviceAddress) -> Option<Self> {
        let mut bytes = [0u8; HEADER_SIZE as usize];
        memory.read(address, &mut bytes).ok()?;
        let header: BlobHeader = bytemuck::pod_read_unaligned(&bytes);
        (BLOB_MAGIC == header.magic && header.kind().is_some()).then_some(header)
    }

    pub fn info(&self) -> Option<StructureInfo> {
        let b = self.bounds;
        Some(StructureInfo {
            kind: self.kind()?,
            cluster_id: self.cluster_id,
            primitive_count: self.primitive_count,
            vertex_count: self.vertex_count,
            size_in_bytes: HEADER_SIZE + u64::from(self.payload_bytes),
            bounds: [[b[0], b[1], b[2]], [b[3], b[4], b[5]]],
        })
    }
}

fn bounds_of(positions: &[[f32; 3]]) -> [f32; 6] {
    let Some(first) = positions.first() else {
        return [0.0; 6];
    };
    let mut bounds = [first[0], first[1], first[2], first[0], first[1], first[2]];
    for p in positions {
        for axis in 0..3 {
            bounds[axis] = bounds[axis].min(p[axis]);
            bounds[axis + 3] = bounds[axis + 3].max(p[axis]);
        }
    }
    bounds
}

/// A CLAS or a cluster template.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct ClusterBlob {
    pub kind: StructureKind,
    pub cluster_id: u32,
    pub cluster_flags: u32,
    pub position_truncate_bit_count: u32,
    /// Empty for a template built without positions.
    pub positions: Vec<[f32; 3]>,
    pub vertex_count: u32,
    pub primitive_infos: Vec<u32>,
    pub triangles: Vec<[u32; 3]>,
}

impl ClusterBlob {
    pub fn encode(&self) -> Vec<u8> {
        let positions: &[u8] = bytemuck::cast_slice(&self.positions);
        let infos: &[u8] = bytemuck::cast_slice(&self.primitive_infos);
        let triangles: &[u8] = bytemuck::cast_slice(&self.triangles);
        let payload_bytes = positions.len() + infos.len() + triangles.len();

        let header = BlobHeader {
            magic: BLOB_MAGIC,
            kind: self.kind.into(),
            cluster_id: self.cluster_id,
            primitive_count: self.triangles.len() as u32,
            vertex_count: self.vertex_count,
            cluster_flags: self.cluster_flags,
            payload_bytes: payload_bytes as u32,
            position_truncate_bit_count: self.position_truncate_bit_count,
            bounds: bounds_of(&self.positions),
            has_positions: u32::from(!self.positions.is_empty()),
            reserved: 0,
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE as usize + payload_bytes);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(positions);
        bytes.extend_from_slice(infos);
        bytes.extend_from_slice(triangles);
        bytes
    }

    /// Reads a CLAS or template back from `address`.
    pub fn read(memory: &dyn DeviceMemory, address: DeviceAddress) -> Option<Self> {
        let header = BlobHeader::read(memory, address)?;
        let kind = header.kind()?;
        if StructureKind::Blas == kind {
            return None;
        }

        let payload = memory
            .read_vec(address.offset(HEADER_SIZE)?, header.payload_bytes.into())
            .ok()?;
        let vertex_count = header.vertex_count as usize;
        let triangle_count = header.primitive_count as usize;
        let position_bytes = if 0 != header.has_positions {
            vertex_count * 12
        } else {
            0
        };
        let info_bytes = triangle_count * 4;
        if payload.len() != position_bytes + info_bytes + triangle_count * 12 {
            return None;
        }

        let (position_bytes, rest) = payload.split_at(position_bytes);
        let (info_bytes, triangle_bytes) = rest.split_at(info_bytes);
        Some(Self {
            kind,
            cluster_id: header.cluster_id,
            cluster_flags: header.cluster_flags,
            position_truncate_bit_count: header.position_truncate_bit_count,
            positions: position_bytes
                .chunks_exact(12)
                .map(bytemuck::pod_read_unaligned)
                .collect(),
            vertex_count: header.vertex_count,
            primitive_infos: info_bytes
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned)
                .collect(),
            triangles: triangle_bytes
                .chunks_exact(12)
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        })
    }
}

/// A BLAS referencing its clusters by handle.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct BlasBlob {
    pub clusters: Vec<u64>,
    pub triangle_count: u32,
    pub bounds: [f32; 6],
}

impl BlasBlob {
    pub fn encode(&self) -> Vec<u8> {
        let clusters: &[u8] = bytemuck::cast_slice(&self.clusters);
        let header = BlobHeader {
            magic: BLOB_MAGIC,
            kind: StructureKind::Blas.into(),
            primitive_count: self.clusters.len() as u32,
            // Total triangles across all clusters.
            vertex_count: self.triangle_count,
            payload_bytes: clusters.len() as u32,
            bounds: self.bounds,
            ..Default::default()
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE as usize + clusters.len());
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(clusters);
        bytes
    }
}

/// Grows `bounds` by the header bounds of a cluster.
pub(super) fn merge_bounds(bounds: &mut Option<[f32; 6]>, other: [f32; 6]) {
    let merged = match bounds {
        None => other,
        Some(b) => [
            b[0].min(other[0]),
            b[1].min(other[1]),
            b[2].min(other[2]),
            b[3].max(other[3]),
            b[4].max(other[4]),
            b[5].max(other[5]),
        ],
    };
    *bounds = Some(merged);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_bounds_cover_all_positions() {
        let blob = ClusterBlob {
            kind: StructureKind::Cluster,
            cluster_id: 3,
            cluster_flags: 0,
            position_truncate_bit_count: 0,
            positions: vec![[0.0, 1.0, -1.0], [2.0, -3.0, 0.5]],
            vertex_count: 2,
            primitive_infos: vec![0],
            triangles: vec![[0, 1, 1]],
        };
        let bytes = blob.encode();
        assert_eq!(bytes.len() as u64, HEADER_SIZE + 24 + 4 + 12);

        let header: BlobHeader = bytemuck::pod_read_unaligned(&bytes[..64]);
        assert_eq!(header.magic, BLOB_MAGIC);
        assert_eq!(header.bounds, [0.0, -3.0, -1.0, 2.0, 1.0, 0.5]);
        assert_eq!(header.info().map(|info| info.kind), Some(StructureKind::Cluster));
    }
}

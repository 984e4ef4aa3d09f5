use super::{check_len, ArgsRecord, CodecError, LeReader, LeWriter};
use crate::{DeviceAddress, Handle};
use cluster_accel_sys as sys;

/// Input record of one instance for `clas_from_templates`.
///
/// The instance takes its topology from `cluster_template` and its vertex
/// positions from `vertex_buffer`. Its cluster id and SBT index are the
/// template's plus the offsets given here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TemplatesArgs {
    pub cluster_id_offset: u32,
    pub sbt_index_offset: u32,
    pub cluster_template: Handle,
    pub vertex_buffer: DeviceAddress,
    /// 0 means 12 bytes (three `f32`).
    pub vertex_stride_in_bytes: u32,
}

impl TemplatesArgs {
    pub fn new(
        cluster_template: Handle,
        vertex_buffer: DeviceAddress,
        vertex_stride_in_bytes: u32,
        cluster_id_offset: u32,
        sbt_index_offset: u32,
    ) -> Self {
        Self {
            cluster_id_offset,
            sbt_index_offset,
            cluster_template,
            vertex_buffer,
            vertex_stride_in_bytes,
        }
    }

    pub fn to_raw(&self) -> sys::ClusterAccelBuildInputTemplatesArgs {
        sys::ClusterAccelBuildInputTemplatesArgs {
            cluster_id_offset: self.cluster_id_offset,
            sbt_index_offset: self.sbt_index_offset,
            cluster_template: self.cluster_template.raw(),
            vertex_buffer: self.vertex_buffer.raw(),
            vertex_stride_in_bytes: self.vertex_stride_in_bytes,
            reserved: 0,
        }
    }

    pub fn from_raw(raw: &sys::ClusterAccelBuildInputTemplatesArgs) -> Result<Self, CodecError> {
        if 0 != raw.reserved {
            return Err(CodecError::ReservedBitsSet("TemplatesArgs.reserved"));
        }
        Ok(Self {
            cluster_id_offset: raw.cluster_id_offset,
            sbt_index_offset: raw.sbt_index_offset,
            cluster_template: Handle::from_raw(raw.cluster_template),
            vertex_buffer: raw.vertex_buffer.into(),
            vertex_stride_in_bytes: raw.vertex_stride_in_bytes,
        })
    }

    pub fn effective_vertex_stride(&self) -> u64 {
        match self.vertex_stride_in_bytes {
            0 => 12,
            stride => stride.into(),
        }
    }
}

impl ArgsRecord for TemplatesArgs {
    const SIZE: u32 = 32;

    fn pack_into(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        check_len(dst, Self::SIZE)?;
        let raw = self.to_raw();

        let mut w = LeWriter::new(dst);
        w.u32(raw.cluster_id_offset);
        w.u32(raw.sbt_index_offset);
        w.u64(raw.cluster_template);
        w.u64(raw.vertex_buffer);
        w.u32(raw.vertex_stride_in_bytes);
        w.u32(raw.reserved);
        Ok(())
    }

    fn unpack(src: &[u8]) -> Result<Self, CodecError> {
        check_len(src, Self::SIZE)?;

        let mut r = LeReader::new(src);
        Self::from_raw(&sys::ClusterAccelBuildInputTemplatesArgs {
            cluster_id_offset: r.u32(),
            sbt_index_offset: r.u32(),
            cluster_template: r.u64(),
            vertex_buffer: r.u64(),
            vertex_stride_in_bytes: r.u32(),
            reserved: r.u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_at_native_offsets() {
        let args = TemplatesArgs::new(
            Handle::from_raw(0xdead_0000),
            DeviceAddress::new(0xbeef_0000),
            12,
            3,
            1,
        );
        let bytes = args.to_bytes().unwrap();

        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0..4], 3u32.to_le_bytes());
        assert_eq!(bytes[4..8], 1u32.to_le_bytes());
        assert_eq!(bytes[8..16], 0xdead_0000u64.to_le_bytes());
        assert_eq!(bytes[16..24], 0xbeef_0000u64.to_le_bytes());
        assert_eq!(bytes[24..28], 12u32.to_le_bytes());
        assert_eq!(bytes[28..32], [0; 4]);
        assert_eq!(TemplatesArgs::unpack(&bytes).unwrap(), args);
    }

    #[test]
    fn unpack_rejects_reserved_word() {
        let mut bytes = TemplatesArgs::default().to_bytes().unwrap();
        bytes[28] = 1;
        assert_eq!(
            TemplatesArgs::unpack(&bytes),
            Err(CodecError::ReservedBitsSet("TemplatesArgs.reserved"))
        );
    }
}

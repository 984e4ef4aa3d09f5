use super::{check_len, ArgsRecord, CodecError, LeReader, LeWriter};
use crate::DeviceAddress;
use cluster_accel_sys as sys;

/// Input record of one BLAS for `blas_from_clas`: a list of CLAS handles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClustersArgs {
    pub cluster_handles_count: u32,
    /// 0 means 8 bytes (tightly packed handles).
    pub cluster_handles_buffer_stride_in_bytes: u32,
    pub cluster_handles_buffer: DeviceAddress,
}

impl ClustersArgs {
    pub fn new(
        cluster_handles_count: u32,
        cluster_handles_buffer: DeviceAddress,
        cluster_handles_buffer_stride_in_bytes: u32,
    ) -> Self {
        Self {
            cluster_handles_count,
            cluster_handles_buffer_stride_in_bytes,
            cluster_handles_buffer,
        }
    }

    pub fn to_raw(&self) -> sys::ClusterAccelBuildInputClustersArgs {
        sys::ClusterAccelBuildInputClustersArgs {
            cluster_handles_count: self.cluster_handles_count,
            cluster_handles_buffer_stride_in_bytes: self.cluster_handles_buffer_stride_in_bytes,
            cluster_handles_buffer: self.cluster_handles_buffer.raw(),
        }
    }

    pub fn from_raw(raw: &sys::ClusterAccelBuildInputClustersArgs) -> Self {
        Self {
            cluster_handles_count: raw.cluster_handles_count,
            cluster_handles_buffer_stride_in_bytes: raw.cluster_handles_buffer_stride_in_bytes,
            cluster_handles_buffer: raw.cluster_handles_buffer.into(),
        }
    }

    pub fn effective_handle_stride(&self) -> u64 {
        match self.cluster_handles_buffer_stride_in_bytes {
            0 => sys::HANDLE_STRIDE_IN_BYTES.into(),
            stride => stride.into(),
        }
    }
}

impl ArgsRecord for ClustersArgs {
    const SIZE: u32 = 16;

    fn pack_into(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        check_len(dst, Self::SIZE)?;
        let raw = self.to_raw();

        let mut w = LeWriter::new(dst);
        w.u32(raw.cluster_handles_count);
        w.u32(raw.cluster_handles_buffer_stride_in_bytes);
        w.u64(raw.cluster_handles_buffer);
        Ok(())
    }

    fn unpack(src: &[u8]) -> Result<Self, CodecError> {
        check_len(src, Self::SIZE)?;

        let mut r = LeReader::new(src);
        Ok(Self::from_raw(&sys::ClusterAccelBuildInputClustersArgs {
            cluster_handles_count: r.u32(),
            cluster_handles_buffer_stride_in_bytes: r.u32(),
            cluster_handles_buffer: r.u64(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::pack_records;

    #[test]
    fn packs_at_native_offsets() {
        let bytes = ClustersArgs::new(2, DeviceAddress::new(0x4000), 0)
            .to_bytes()
            .unwrap();
        assert_eq!(bytes[0..4], 2u32.to_le_bytes());
        assert_eq!(bytes[4..8], [0; 4]);
        assert_eq!(bytes[8..16], 0x4000u64.to_le_bytes());
    }

    #[test]
    fn pack_records_honors_stride() {
        let args = [
            ClustersArgs::new(1, DeviceAddress::new(0x100), 8),
            ClustersArgs::new(2, DeviceAddress::new(0x200), 8),
        ];
        let bytes = pack_records(&args, 24).unwrap();
        assert_eq!(bytes.len(), 48);
        assert_eq!(bytes[16..24], [0; 8]);
        assert_eq!(ClustersArgs::unpack(&bytes[24..]).unwrap(), args[1]);

        assert_eq!(
            pack_records(&args, 8),
            Err(CodecError::StrideTooSmall {
                stride: 8,
                size: 16
            })
        );
    }
}

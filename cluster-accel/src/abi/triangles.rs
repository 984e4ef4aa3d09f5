use super::{check_len, get_bits, put_bits, ArgsRecord, CodecError, LeReader, LeWriter};
use crate::DeviceAddress;
use cluster_accel_sys as sys;
use cluster_accel_sys::IndicesFormat;

/// Shader binding table index and flags of a primitive.
///
/// Packs into one `u32`: a 24 bit SBT index, 5 reserved bits and 3 flag bits
/// (`PRIMITIVE_FLAG_*`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PrimitiveInfo {
    pub sbt_index: u32,
    pub primitive_flags: u32,
}

impl PrimitiveInfo {
    pub fn pack(&self) -> Result<u32, CodecError> {
        let mut word = 0;
        put_bits(
            &mut word,
            sys::SBT_INDEX_BITS,
            self.sbt_index,
            "PrimitiveInfo.sbt_index",
        )?;
        put_bits(
            &mut word,
            sys::PRIMITIVE_FLAGS_BITS,
            self.primitive_flags,
            "PrimitiveInfo.primitive_flags",
        )?;
        Ok(word)
    }

    pub fn unpack(word: u32) -> Result<Self, CodecError> {
        if 0 != get_bits(word, sys::PRIMITIVE_INFO_RESERVED_BITS) {
            return Err(CodecError::ReservedBitsSet("PrimitiveInfo"));
        }
        Ok(Self {
            sbt_index: get_bits(word, sys::SBT_INDEX_BITS),
            primitive_flags: get_bits(word, sys::PRIMITIVE_FLAGS_BITS),
        })
    }
}

/// Input record of one cluster for `clas_from_triangles` and
/// `templates_from_triangles`.
///
/// For templates, `vertex_buffer` may be [`DeviceAddress::NULL`]; the
/// template then carries topology only and receives its positions on
/// instantiation.
///
/// A stride of 0 means "tightly packed": the index element size, 12 bytes
/// per vertex and 4 bytes per primitive info.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrianglesArgs {
    pub cluster_id: u32,
    /// `CLUSTER_FLAG_*` bits.
    pub cluster_flags: u32,
    /// Up to 256.
    pub triangle_count: u32,
    /// Up to 256.
    pub vertex_count: u32,
    /// Low mantissa bits dropped from each vertex position component.
    pub position_truncate_bit_count: u32,
    pub index_format: IndicesFormat,
    pub opacity_micromap_index_format: Option<IndicesFormat>,
    /// Applies to every triangle unless `primitive_info_buffer` is set.
    pub base_primitive_info: PrimitiveInfo,
    pub index_buffer_stride_in_bytes: u16,
    pub vertex_buffer_stride_in_bytes: u16,
    pub primitive_info_buffer_stride_in_bytes: u16,
    pub opacity_micromap_index_buffer_stride_in_bytes: u16,
    pub index_buffer: DeviceAddress,
    pub vertex_buffer: DeviceAddress,
    /// Optional per-triangle [`PrimitiveInfo`] words.
    pub primitive_info_buffer: DeviceAddress,
    pub opacity_micromap_array: DeviceAddress,
    pub opacity_micromap_index_buffer: DeviceAddress,
    pub instantiation_bounding_box_limit: DeviceAddress,
}

impl Default for TrianglesArgs {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            cluster_flags: sys::CLUSTER_FLAG_NONE,
            triangle_count: 0,
            vertex_count: 0,
            position_truncate_bit_count: 0,
            index_format: IndicesFormat::Bits32,
            opacity_micromap_index_format: None,
            base_primitive_info: PrimitiveInfo::default(),
            index_buffer_stride_in_bytes: 0,
            vertex_buffer_stride_in_bytes: 0,
            primitive_info_buffer_stride_in_bytes: 0,
            opacity_micromap_index_buffer_stride_in_bytes: 0,
            index_buffer: DeviceAddress::NULL,
            vertex_buffer: DeviceAddress::NULL,
            primitive_info_buffer: DeviceAddress::NULL,
            opacity_micromap_array: DeviceAddress::NULL,
            opacity_micromap_index_buffer: DeviceAddress::NULL,
            instantiation_bounding_box_limit: DeviceAddress::NULL,
        }
    }
}

impl TrianglesArgs {
    /// A cluster with the commonly used fields set and everything else
    /// zero.
    pub fn new(
        cluster_id: u32,
        triangle_count: u32,
        vertex_count: u32,
        index_buffer: DeviceAddress,
        vertex_buffer: DeviceAddress,
        vertex_buffer_stride_in_bytes: u16,
        index_format: IndicesFormat,
    ) -> Self {
        Self {
            cluster_id,
            triangle_count,
            vertex_count,
            index_buffer,
            vertex_buffer,
            vertex_buffer_stride_in_bytes,
            index_format,
            index_buffer_stride_in_bytes: index_format.element_size() as u16,
            ..Default::default()
        }
    }

    /// Converts into the raw record, packing the bit-field words.
    pub fn to_raw(&self) -> Result<sys::ClusterAccelBuildInputTrianglesArgs, CodecError> {
        let mut packed_counts = 0;
        put_bits(
            &mut packed_counts,
            sys::TRIANGLE_COUNT_BITS,
            self.triangle_count,
            "TrianglesArgs.triangle_count",
        )?;
        put_bits(
            &mut packed_counts,
            sys::VERTEX_COUNT_BITS,
            self.vertex_count,
            "TrianglesArgs.vertex_count",
        )?;
        put_bits(
            &mut packed_counts,
            sys::POSITION_TRUNCATE_BIT_COUNT_BITS,
            self.position_truncate_bit_count,
            "TrianglesArgs.position_truncate_bit_count",
        )?;
        put_bits(
            &mut packed_counts,
            sys::INDEX_FORMAT_BITS,
            self.index_format.into(),
            "TrianglesArgs.index_format",
        )?;
        put_bits(
            &mut packed_counts,
            sys::OPACITY_MICROMAP_INDEX_FORMAT_BITS,
            self.opacity_micromap_index_format.map_or(0, u32::from),
            "TrianglesArgs.opacity_micromap_index_format",
        )?;

        Ok(sys::ClusterAccelBuildInputTrianglesArgs {
            cluster_id: self.cluster_id,
            cluster_flags: self.cluster_flags,
            packed_counts,
            base_primitive_info: self.base_primitive_info.pack()?,
            index_buffer_stride_in_bytes: self.index_buffer_stride_in_bytes,
            vertex_buffer_stride_in_bytes: self.vertex_buffer_stride_in_bytes,
            primitive_info_buffer_stride_in_bytes: self.primitive_info_buffer_stride_in_bytes,
            opacity_micromap_index_buffer_stride_in_bytes: self
                .opacity_micromap_index_buffer_stride_in_bytes,
            index_buffer: self.index_buffer.raw(),
            vertex_buffer: self.vertex_buffer.raw(),
            primitive_info_buffer: self.primitive_info_buffer.raw(),
            opacity_micromap_array: self.opacity_micromap_array.raw(),
            opacity_micromap_index_buffer: self.opacity_micromap_index_buffer.raw(),
            instantiation_bounding_box_limit: self.instantiation_bounding_box_limit.raw(),
        })
    }

    /// Converts from the raw record, unpacking the bit-field words.
    pub fn from_raw(raw: &sys::ClusterAccelBuildInputTrianglesArgs) -> Result<Self, CodecError> {
        let word = raw.packed_counts;
        let format = get_bits(word, sys::INDEX_FORMAT_BITS);
        let index_format =
            IndicesFormat::try_from(format).map_err(|_| CodecError::UnknownIndexFormat(format))?;
        let opacity_micromap_index_format =
            match get_bits(word, sys::OPACITY_MICROMAP_INDEX_FORMAT_BITS) {
                0 => None,
                format => Some(
                    IndicesFormat::try_from(format)
                        .map_err(|_| CodecError::UnknownIndexFormat(format))?,
                ),
            };

        Ok(Self {
            cluster_id: raw.cluster_id,
            cluster_flags: raw.cluster_flags,
            triangle_count: get_bits(word, sys::TRIANGLE_COUNT_BITS),
            vertex_count: get_bits(word, sys::VERTEX_COUNT_BITS),
            position_truncate_bit_count: get_bits(word, sys::POSITION_TRUNCATE_BIT_COUNT_BITS),
            index_format,
            opacity_micromap_index_format,
            base_primitive_info: PrimitiveInfo::unpack(raw.base_primitive_info)?,
            index_buffer_stride_in_bytes: raw.index_buffer_stride_in_bytes,
            vertex_buffer_stride_in_bytes: raw.vertex_buffer_stride_in_bytes,
            primitive_info_buffer_stride_in_bytes: raw.primitive_info_buffer_stride_in_bytes,
            opacity_micromap_index_buffer_stride_in_bytes: raw
                .opacity_micromap_index_buffer_stride_in_bytes,
            index_buffer: raw.index_buffer.into(),
            vertex_buffer: raw.vertex_buffer.into(),
            primitive_info_buffer: raw.primitive_info_buffer.into(),
            opacity_micromap_array: raw.opacity_micromap_array.into(),
            opacity_micromap_index_buffer: raw.opacity_micromap_index_buffer.into(),
            instantiation_bounding_box_limit: raw.instantiation_bounding_box_limit.into(),
        })
    }

    /// Index stride with the tightly packed default applied.
    pub fn effective_index_stride(&self) -> u64 {
        match self.index_buffer_stride_in_bytes {
            0 => self.index_format.element_size().into(),
            stride => stride.into(),
        }
    }

    /// Vertex stride with the tightly packed default applied.
    pub fn effective_vertex_stride(&self) -> u64 {
        match self.vertex_buffer_stride_in_bytes {
            0 => 12,
            stride => stride.into(),
        }
    }

    pub fn effective_primitive_info_stride(&self) -> u64 {
        match self.primitive_info_buffer_stride_in_bytes {
            0 => 4,
            stride => stride.into(),
        }
    }
}

impl ArgsRecord for TrianglesArgs {
    const SIZE: u32 = 72;

    fn pack_into(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        check_len(dst, Self::SIZE)?;
        let raw = self.to_raw()?;

        let mut w = LeWriter::new(dst);
        w.u32(raw.cluster_id);
        w.u32(raw.cluster_flags);
        w.u32(raw.packed_counts);
        w.u32(raw.base_primitive_info);
        w.u16(raw.index_buffer_stride_in_bytes);
        w.u16(raw.vertex_buffer_stride_in_bytes);
        w.u16(raw.primitive_info_buffer_stride_in_bytes);
        w.u16(raw.opacity_micromap_index_buffer_stride_in_bytes);
        w.u64(raw.index_buffer);
        w.u64(raw.vertex_buffer);
        w.u64(raw.primitive_info_buffer);
        w.u64(raw.opacity_micromap_array);
        w.u64(raw.opacity_micromap_index_buffer);
        w.u64(raw.instantiation_bounding_box_limit);
        Ok(())
    }

    fn unpack(src: &[u8]) -> Result<Self, CodecError> {
        check_len(src, Self::SIZE)?;

        let mut r = LeReader::new(src);
        let raw = sys::ClusterAccelBuildInputTrianglesArgs {
            cluster_id: r.u32(),
            cluster_flags: r.u32(),
            packed_counts: r.u32(),
            base_primitive_info: r.u32(),
            index_buffer_stride_in_bytes: r.u16(),
            vertex_buffer_stride_in_bytes: r.u16(),
            primitive_info_buffer_stride_in_bytes: r.u16(),
            opacity_micromap_index_buffer_stride_in_bytes: r.u16(),
            index_buffer: r.u64(),
            vertex_buffer: r.u64(),
            primitive_info_buffer: r.u64(),
            opacity_micromap_array: r.u64(),
            opacity_micromap_index_buffer: r.u64(),
            instantiation_bounding_box_limit: r.u64(),
        };
        Self::from_raw(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrianglesArgs {
        TrianglesArgs {
            cluster_id: 7,
            triangle_count: 2,
            vertex_count: 4,
            position_truncate_bit_count: 3,
            index_format: IndicesFormat::Bits16,
            base_primitive_info: PrimitiveInfo {
                sbt_index: 5,
                primitive_flags: sys::PRIMITIVE_FLAG_DISABLE_ANYHIT,
            },
            vertex_buffer_stride_in_bytes: 16,
            index_buffer: DeviceAddress::new(0x1000),
            vertex_buffer: DeviceAddress::new(0x2000),
            ..Default::default()
        }
    }

    #[test]
    fn packs_fields_at_native_offsets() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(bytes.len(), 72);

        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let dword = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());

        assert_eq!(word(0), 7);
        // 2 | 4 << 9 | 3 << 18 | 2 << 24
        assert_eq!(word(8), 2 | (4 << 9) | (3 << 18) | (2 << 24));
        assert_eq!(word(12), 5 | (sys::PRIMITIVE_FLAG_DISABLE_ANYHIT << 29));
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 16);
        assert_eq!(dword(24), 0x1000);
        assert_eq!(dword(32), 0x2000);
        assert_eq!(dword(64), 0);
    }

    #[test]
    fn unpack_inverts_pack() {
        let args = sample();
        let bytes = args.to_bytes().unwrap();
        assert_eq!(TrianglesArgs::unpack(&bytes).unwrap(), args);
    }

    #[test]
    fn rejects_values_wider_than_their_field() {
        let args = TrianglesArgs {
            triangle_count: 512,
            ..sample()
        };
        assert!(matches!(
            args.to_bytes(),
            Err(CodecError::FieldOverflow { width: 9, .. })
        ));

        let args = TrianglesArgs {
            base_primitive_info: PrimitiveInfo {
                sbt_index: 1 << 24,
                primitive_flags: 0,
            },
            ..sample()
        };
        assert!(args.to_bytes().is_err());
    }

    #[test]
    fn unpack_rejects_unknown_index_format() {
        let mut bytes = sample().to_bytes().unwrap();
        // Index format 3 lives in bits 24..28 of the word at offset 8.
        bytes[11] = (bytes[11] & 0xf0) | 3;
        assert_eq!(
            TrianglesArgs::unpack(&bytes),
            Err(CodecError::UnknownIndexFormat(3))
        );
    }

    #[test]
    fn unpack_rejects_short_buffers() {
        assert!(matches!(
            TrianglesArgs::unpack(&[0u8; 40]),
            Err(CodecError::BufferTooSmall {
                expected: 72,
                actual: 40
            })
        ));
    }

    #[test]
    fn new_defaults_index_stride_to_element_size() {
        let args = TrianglesArgs::new(
            1,
            1,
            3,
            DeviceAddress::new(0x10),
            DeviceAddress::new(0x20),
            0,
            IndicesFormat::Bits8,
        );
        assert_eq!(args.index_buffer_stride_in_bytes, 1);
        assert_eq!(args.effective_vertex_stride(), 12);
    }
}

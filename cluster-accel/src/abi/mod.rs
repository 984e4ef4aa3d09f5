//! # Argument Record Codec
//!
//! Build commands read their per-argument inputs from device memory as
//! fixed-layout records. There is one record type per operation family:
//!
//! | Record | Size | Consumed by |
//! |---|---|---|
//! | [`TrianglesArgs`] | 72 | `clas_from_triangles`, `templates_from_triangles` |
//! | [`TemplatesArgs`] | 32 | `clas_from_templates` |
//! | [`ClustersArgs`] | 16 | `blas_from_clas` |
//!
//! The byte layout is the contract, not the producer: records may be packed
//! on the host and copied into a buffer, or written directly by a compute
//! kernel. Either way they must match what [`ArgsRecord::pack_into()`]
//! produces: little-endian, naturally aligned fields, with the packed count
//! and primitive-info words laid out as in the *OptiX* headers (see
//! [`cluster_accel_sys`] for the raw declarations).
//!
//! Packing never truncates: a value that does not fit its bit field is a
//! [`CodecError`].
//!
//! ## Example
//!
//! ```
//! use cluster_accel::abi::{pack_records, ArgsRecord, ClustersArgs};
//! use cluster_accel::DeviceAddress;
//!
//! let args = [
//!     ClustersArgs::new(2, DeviceAddress::new(0x1000), 8),
//!     ClustersArgs::new(1, DeviceAddress::new(0x2000), 8),
//! ];
//! let bytes = pack_records(&args, 0).unwrap();
//! assert_eq!(bytes.len(), 2 * ClustersArgs::SIZE as usize);
//! assert_eq!(ClustersArgs::unpack(&bytes[16..]).unwrap(), args[1]);
//! ```
use cluster_accel_sys::BitField;
use thiserror::Error;

mod clusters;
mod templates;
mod triangles;

pub use clusters::ClustersArgs;
pub use templates::TemplatesArgs;
pub use triangles::{PrimitiveInfo, TrianglesArgs};

pub use cluster_accel_sys::{
    IndicesFormat, CLUSTER_FLAG_ALLOW_DISABLE_OPACITY_MICROMAPS, CLUSTER_FLAG_NONE,
    PRIMITIVE_FLAG_DISABLE_ANYHIT, PRIMITIVE_FLAG_DISABLE_TRIANGLE_FACE_CULLING,
    PRIMITIVE_FLAG_NONE, PRIMITIVE_FLAG_REQUIRE_SINGLE_ANYHIT_CALL,
};

/// Errors raised while packing or unpacking argument records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A value does not fit the bit field reserved for it.
    #[error("{field} = {value} does not fit in {width} bits")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        width: u32,
    },

    /// The byte buffer is shorter than the record.
    #[error("Record needs {expected} bytes, buffer has {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    /// A record stride smaller than the record itself.
    #[error("Stride {stride} is smaller than the {size} byte record")]
    StrideTooSmall { stride: u32, size: u32 },

    /// The index format field holds no known format.
    #[error("Unknown index format {0}")]
    UnknownIndexFormat(u32),

    /// A reserved field or reserved bits are not zero.
    #[error("Reserved bits set in {0}")]
    ReservedBitsSet(&'static str),
}

/// A fixed-layout argument record.
pub trait ArgsRecord: Sized {
    /// Size of the packed record in bytes. The minimum argument stride.
    const SIZE: u32;

    /// Writes the record into the first [`SIZE`](Self::SIZE) bytes of `dst`.
    fn pack_into(&self, dst: &mut [u8]) -> Result<(), CodecError>;

    /// Reads a record from the first [`SIZE`](Self::SIZE) bytes of `src`.
    fn unpack(src: &[u8]) -> Result<Self, CodecError>;

    /// Packs the record into a freshly allocated buffer.
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = vec![0u8; Self::SIZE as usize];
        self.pack_into(&mut bytes)?;
        Ok(bytes)
    }
}

/// Packs `records` back to back, `stride` bytes apart.
///
/// A `stride` of 0 packs them tightly. Bytes between records are zero.
pub fn pack_records<R: ArgsRecord>(records: &[R], stride: u32) -> Result<Vec<u8>, CodecError> {
    let stride = if 0 == stride { R::SIZE } else { stride };
    if stride < R::SIZE {
        return Err(CodecError::StrideTooSmall {
            stride,
            size: R::SIZE,
        });
    }

    let stride = stride as usize;
    let mut bytes = vec![0u8; records.len() * stride];
    for (record, chunk) in records.iter().zip(bytes.chunks_exact_mut(stride)) {
        record.pack_into(chunk)?;
    }
    Ok(bytes)
}

/// Inserts `value` into `word` at `field`.
pub(crate) fn put_bits(
    word: &mut u32,
    field: BitField,
    value: u32,
    name: &'static str,
) -> Result<(), CodecError> {
    if value > field.max_value() {
        return Err(CodecError::FieldOverflow {
            field: name,
            value: value.into(),
            width: field.width,
        });
    }
    *word = (*word & !field.mask()) | (value << field.shift);
    Ok(())
}

#[inline]
pub(crate) fn get_bits(word: u32, field: BitField) -> u32 {
    (word & field.mask()) >> field.shift
}

pub(crate) fn check_len(buf: &[u8], size: u32) -> Result<(), CodecError> {
    if buf.len() < size as usize {
        Err(CodecError::BufferTooSmall {
            expected: size as usize,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Sequential little-endian writer over a record-sized slice.
pub(crate) struct LeWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> LeWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }
}

/// Sequential little-endian reader, the counterpart of [`LeWriter`].
pub(crate) struct LeReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub(crate) fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    pub(crate) fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    pub(crate) fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

//! Host-backed device memory with 64-bit addresses.
use crate::backend::DeviceMemory;
use crate::error::{Error, Result};
use crate::{align_up, DeviceAddress};
use std::collections::BTreeMap;

/// Live allocations, keyed by base address.
///
/// Addresses are handed out from a bump pointer and never reused, so a
/// dangling address faults instead of silently reaching a newer buffer.
#[derive(Debug)]
pub(crate) struct MemoryHeap {
    regions: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    alignment: u64,
}

impl MemoryHeap {
    pub fn new(base_address: u64, alignment: u64) -> Self {
        Self {
            regions: BTreeMap::new(),
            next_address: base_address.max(alignment),
            alignment,
        }
    }

    pub fn allocate(&mut self, size: u64) -> Result<DeviceAddress> {
        let len = usize::try_from(size).map_err(|_| Error::InvalidBufferSize {
            expected: usize::MAX as u64,
            actual: size,
        })?;
        let base = align_up(self.next_address, self.alignment).ok_or(Error::AddressOutOfBounds {
            address: DeviceAddress::new(self.next_address),
            len: size,
        })?;
        // Keep at least one alignment unit between buffers.
        self.next_address = base
            .checked_add(size.max(1))
            .and_then(|end| end.checked_add(self.alignment))
            .ok_or(Error::AddressOutOfBounds {
                address: DeviceAddress::new(base),
                len: size,
            })?;

        self.regions.insert(base, vec![0u8; len]);
        log::trace!("Allocated {size} bytes at {base:#x}");
        Ok(DeviceAddress::new(base))
    }

    pub fn free(&mut self, address: DeviceAddress) {
        if self.regions.remove(&address.raw()).is_some() {
            log::trace!("Freed buffer at {address}");
        }
    }

    /// The region containing `address` and the offset of `address` in it.
    fn locate(&self, address: DeviceAddress) -> Option<(u64, usize)> {
        let (&base, region) = self.regions.range(..=address.raw()).next_back()?;
        let offset = address.raw() - base;
        (offset < region.len() as u64).then_some((base, offset as usize))
    }

    fn range(&self, address: DeviceAddress, len: usize) -> Result<(u64, std::ops::Range<usize>)> {
        let out_of_bounds = || Error::AddressOutOfBounds {
            address,
            len: len as u64,
        };
        let (base, offset) = self.locate(address).ok_or_else(out_of_bounds)?;
        let end = offset.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.regions[&base].len() {
            return Err(out_of_bounds());
        }
        Ok((base, offset..end))
    }
}

impl DeviceMemory for MemoryHeap {
    fn read(&self, address: DeviceAddress, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let (base, range) = self.range(address, dst.len())?;
        dst.copy_from_slice(&self.regions[&base][range]);
        Ok(())
    }

    fn write(&mut self, address: DeviceAddress, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let (base, range) = self.range(address, src.len())?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(Error::AddressOutOfBounds {
                address,
                len: src.len() as u64,
            })?;
        region[range].copy_from_slice(src);
        Ok(())
    }

    fn extent(&self, address: DeviceAddress) -> Option<u64> {
        let (base, offset) = self.locate(address)?;
        Some((self.regions[&base].len() - offset) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut heap = MemoryHeap::new(0x1_0000, 256);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(1).unwrap();
        assert_eq!(a.raw() % 256, 0);
        assert_eq!(b.raw() % 256, 0);
        assert!(b.raw() >= a.raw() + 100);
    }

    #[test]
    fn accesses_must_stay_inside_one_buffer() {
        let mut heap = MemoryHeap::new(0x1_0000, 256);
        let a = heap.allocate(16).unwrap();
        heap.write(a.offset(8).unwrap(), &[1; 8]).unwrap();
        assert!(heap.write(a.offset(12).unwrap(), &[1; 8]).is_err());
        assert_eq!(heap.extent(a.offset(4).unwrap()), Some(12));
        assert_eq!(heap.extent(a.offset(16).unwrap()), None);

        let mut bytes = [0u8; 4];
        heap.read(a.offset(8).unwrap(), &mut bytes).unwrap();
        assert_eq!(bytes, [1; 4]);
    }

    #[test]
    fn freed_addresses_fault() {
        let mut heap = MemoryHeap::new(0x1_0000, 256);
        let a = heap.allocate(16).unwrap();
        heap.free(a);
        assert!(heap.read(a, &mut [0u8; 4]).is_err());
        assert_ne!(heap.allocate(16).unwrap(), a);
    }
}

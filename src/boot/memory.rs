//! Guest physical memory.
//!
//! A single `vm_memory::GuestMemoryMmap` holds the guest's RAM. Small
//! configurations are one contiguous region at guest physical 0. When the
//! configured size crosses the MMIO hole at 3.25 GiB, the hole is left
//! unmapped and the remainder is placed at 4 GiB as a second region, which
//! becomes a second KVM memory slot.
//!
//! Device code addresses guest memory exclusively through the checked
//! `read`/`write` accessors here; the guest is trusted, so a failed access
//! is a guest bug to be logged, not a condition the guest gets to see.

use super::BootError;
use vm_memory::{
    Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap, GuestMemoryRegion,
};

/// Errors raised by guest memory accessors.
pub type MemoryError = vm_memory::GuestMemoryError;

/// Start of the MMIO hole: guest physical 3.25 GiB.
pub const MMIO_HOLE_START: u64 = 0xD000_0000;

/// End of the MMIO hole: the first address past 32 bits.
pub const MMIO_HOLE_END: u64 = 0x1_0000_0000;

/// Guest RAM, in one region or two around the MMIO hole.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate guest RAM of the given total size.
    ///
    /// RAM is preserved across the hole: anything beyond 3.25 GiB lands at
    /// guest physical 4 GiB.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let regions: Vec<(GuestAddress, usize)> = if size <= MMIO_HOLE_START {
            vec![(GuestAddress(0), size as usize)]
        } else {
            vec![
                (GuestAddress(0), MMIO_HOLE_START as usize),
                (GuestAddress(MMIO_HOLE_END), (size - MMIO_HOLE_START) as usize),
            ]
        };

        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| BootError::MemoryAllocation(std::io::Error::other(e.to_string())))?;

        Ok(Self { inner, size })
    }

    /// Total RAM in bytes (not counting the hole).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// RAM beyond the hole, if any, as `(guest_addr, size)`.
    pub fn high_region(&self) -> Option<(u64, u64)> {
        if self.size > MMIO_HOLE_START {
            Some((MMIO_HOLE_END, self.size - MMIO_HOLE_START))
        } else {
            None
        }
    }

    /// Iterate `(guest_addr, size, host_addr)` per region, in slot order.
    pub fn regions(&self) -> Vec<(u64, u64, u64)> {
        self.inner
            .iter()
            .map(|r| (r.start_addr().0, r.len(), r.as_ptr() as u64))
            .collect()
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner.write_slice(data, GuestAddress(addr))
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner.read_slice(data, GuestAddress(addr))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_single_region() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        assert_eq!(mem.regions().len(), 1);
        assert!(mem.high_region().is_none());
    }

    #[test]
    fn test_hole_split() {
        // 3.25 GiB + 16 MiB: the tail moves above 4 GiB.
        let size = MMIO_HOLE_START + (16 << 20);
        let mem = GuestMemory::new(size).unwrap();
        let regions = mem.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].0, 0);
        assert_eq!(regions[0].1, MMIO_HOLE_START);
        assert_eq!(regions[1].0, MMIO_HOLE_END);
        assert_eq!(regions[1].1, 16 << 20);
        assert_eq!(mem.high_region(), Some((MMIO_HOLE_END, 16 << 20)));

        // Accesses on both sides of the hole work; the hole itself fails.
        mem.write_u64(0x1000, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0x1122_3344_5566_7788);
        mem.write_u32(MMIO_HOLE_END + 0x10, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(MMIO_HOLE_END + 0x10).unwrap(), 0xdead_beef);
        assert!(mem.write_u8(MMIO_HOLE_START + 0x1000, 1).is_err());
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_int_accessors() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u16(100, 0xbeef).unwrap();
        assert_eq!(mem.read_u16(100).unwrap(), 0xbeef);
        mem.write_u32(104, 0x1234_5678).unwrap();
        assert_eq!(read_vec(&mem, 104, 4), vec![0x78, 0x56, 0x34, 0x12]);
        mem.write_u64(112, 0x1234_5678_9abc_def0).unwrap();
        assert_eq!(mem.read_u64(112).unwrap(), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = GuestMemory::new(4096).unwrap();
        assert!(mem.write(4095, &[1, 2]).is_err());
        let mut buf = [0u8; 2];
        assert!(mem.read(4095, &mut buf).is_err());
    }
}

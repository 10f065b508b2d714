//! Address-routed device buses.
//!
//! One `Bus` instance serves the port I/O space and another the MMIO
//! space. Endpoints are `[base, base + width)` ranges that must not
//! overlap; dispatch is a linear scan, which is plenty for a handful of
//! devices. A miss is a guest bug: it is logged at warning level and reads
//! return zeros, except for a small allow-list of ports (BIOS POST) that
//! are ignored silently.
//!
//! Entries are shared `Arc<Mutex<_>>` handles because some devices are
//! touched from more than one thread: the exit loop services register
//! accesses while the terminal reader feeds the UART's RX FIFO.

use std::sync::{Arc, Mutex};

use log::warn;

use super::DeviceError;

/// A device reachable through a bus window.
///
/// `offset` is relative to the endpoint base; `data` is the access payload
/// as KVM hands it over (1, 2, or 4 bytes for port I/O, up to 8 for MMIO).
pub trait BusDevice: Send {
    fn read(&mut self, offset: u64, data: &mut [u8]);
    fn write(&mut self, offset: u64, data: &[u8]);
}

struct BusEntry {
    base: u64,
    width: u64,
    device: Arc<Mutex<dyn BusDevice>>,
}

/// Ordered list of non-overlapping endpoints for one address space.
pub struct Bus {
    name: &'static str,
    entries: Vec<BusEntry>,
    ignored: Vec<u64>,
}

impl Bus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
            ignored: Vec::new(),
        }
    }

    /// Register an endpoint. Fails if the range overlaps an existing one.
    pub fn insert(
        &mut self,
        base: u64,
        width: u64,
        device: Arc<Mutex<dyn BusDevice>>,
    ) -> Result<(), DeviceError> {
        let overlaps = self
            .entries
            .iter()
            .any(|e| base < e.base + e.width && e.base < base + width);
        if overlaps || width == 0 {
            return Err(DeviceError::RangeOverlap { base, width });
        }

        self.entries.push(BusEntry {
            base,
            width,
            device,
        });
        self.entries.sort_by_key(|e| e.base);
        Ok(())
    }

    /// Mark a single address as silently ignored (e.g. BIOS POST 0x80).
    pub fn ignore(&mut self, addr: u64) {
        self.ignored.push(addr);
    }

    fn find(&self, addr: u64) -> Option<(&Arc<Mutex<dyn BusDevice>>, u64)> {
        self.entries
            .iter()
            .find(|e| addr >= e.base && addr < e.base + e.width)
            .map(|e| (&e.device, addr - e.base))
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) {
        if let Some((device, offset)) = self.find(addr) {
            device.lock().unwrap().read(offset, data);
        } else {
            data.fill(0);
            if !self.ignored.contains(&addr) {
                warn!("{}: unhandled read of {} bytes at {:#x}", self.name, data.len(), addr);
            }
        }
    }

    pub fn write(&self, addr: u64, data: &[u8]) {
        if let Some((device, offset)) = self.find(addr) {
            device.lock().unwrap().write(offset, data);
        } else if !self.ignored.contains(&addr) {
            warn!(
                "{}: unhandled write at {:#x} value {:02x?}",
                self.name, addr, data
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDevice {
        value: u32,
        last_offset: u64,
    }

    impl BusDevice for MockDevice {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            self.last_offset = offset;
            let bytes = self.value.to_le_bytes();
            let len = data.len().min(4);
            data[..len].copy_from_slice(&bytes[..len]);
        }

        fn write(&mut self, offset: u64, data: &[u8]) {
            self.last_offset = offset;
            if data.len() >= 4 {
                self.value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
        }
    }

    #[test]
    fn test_routing_and_offsets() {
        let mut bus = Bus::new("test");
        let dev = Arc::new(Mutex::new(MockDevice {
            value: 0x1234_5678,
            last_offset: 0,
        }));
        bus.insert(0x1000, 0x100, dev.clone()).unwrap();

        let mut data = [0u8; 4];
        bus.read(0x10f0, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0x1234_5678);
        assert_eq!(dev.lock().unwrap().last_offset, 0xf0);

        bus.write(0x1004, &0xdead_beefu32.to_le_bytes());
        assert_eq!(dev.lock().unwrap().value, 0xdead_beef);
    }

    #[test]
    fn test_miss_reads_zero() {
        let bus = Bus::new("test");
        let mut data = [0xffu8; 4];
        bus.read(0x9000, &mut data);
        assert_eq!(data, [0; 4]);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut bus = Bus::new("test");
        let mk = || {
            Arc::new(Mutex::new(MockDevice {
                value: 0,
                last_offset: 0,
            }))
        };
        bus.insert(0x3f8, 8, mk()).unwrap();
        assert!(bus.insert(0x3f0, 16, mk()).is_err());
        assert!(bus.insert(0x3ff, 1, mk()).is_err());
        bus.insert(0x400, 8, mk()).unwrap();
    }

    #[test]
    fn test_ignored_address() {
        let mut bus = Bus::new("test");
        bus.ignore(0x80);
        // No device behind 0x80; the access must not panic and reads zero.
        bus.write(0x80, &[0x42]);
        let mut data = [0u8; 1];
        bus.read(0x80, &mut data);
        assert_eq!(data, [0]);
    }
}

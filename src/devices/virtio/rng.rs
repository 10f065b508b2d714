//! virtio-rng entropy backend.
//!
//! One queue of device-writable buffers; each is filled completely from
//! the host entropy pool and published with the number of bytes written.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use log::{error, warn};

use super::queue::Virtqueue;
use super::{VirtioDevice, VIRTIO_ID_RNG};
use crate::boot::GuestMemory;
use crate::kvm::InterruptLine;

const ENTROPY_SOURCE: &str = "/dev/urandom";

pub struct VirtioRng {
    source: File,
    mem: Arc<GuestMemory>,
    queues: Vec<Arc<Virtqueue>>,
    irq: Arc<InterruptLine>,
}

impl VirtioRng {
    pub fn new(mem: Arc<GuestMemory>, irq: Arc<InterruptLine>) -> std::io::Result<Self> {
        Ok(Self {
            source: File::open(ENTROPY_SOURCE)?,
            queues: vec![Arc::new(Virtqueue::new(mem.clone()))],
            mem,
            irq,
        })
    }

    /// Fill every writable descriptor of the chain with entropy; returns
    /// the total bytes written.
    fn fill_chain(&self, queue: &Virtqueue, head: u16) -> u32 {
        let mut total = 0u32;
        let mut desc = queue.desc(head);

        while let Some(d) = desc {
            if d.is_write_only() {
                let mut buf = vec![0u8; d.len as usize];
                if let Err(e) = (&self.source).read_exact(&mut buf) {
                    error!("virtio-rng: entropy read: {e}");
                    break;
                }
                if let Err(e) = self.mem.write(d.addr, &buf) {
                    error!("virtio-rng: guest buffer write: {e}");
                    break;
                }
                total += d.len;
            }
            desc = queue.chain_next(&d);
        }

        total
    }
}

impl VirtioDevice for VirtioRng {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_RNG
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn queues(&self) -> &[Arc<Virtqueue>] {
        &self.queues
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        warn!("virtio-rng: config read at {offset:#x}, device has no config space");
        data.fill(0);
    }

    fn write_config(&mut self, offset: u64, _data: &[u8]) {
        warn!("virtio-rng: config write at {offset:#x}, device has no config space");
    }

    fn notify(&mut self, _queue_index: u32) {
        let queue = self.queues[0].clone();
        while let Some(head) = queue.next() {
            let len = self.fill_chain(&queue, head);
            let used_idx = queue.add_used(head, len);
            if queue.needs_interrupt(used_idx) {
                if let Err(e) = self.irq.set_level(true) {
                    error!("virtio-rng: irq: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::VIRTQ_DESC_F_WRITE;

    const DESC_ADDR: u64 = 0x1000;
    const AVAIL_ADDR: u64 = 0x2000;
    const USED_ADDR: u64 = 0x3000;
    const BUF_ADDR: u64 = 0x8000;

    fn rng_with_request(len: u32) -> (VirtioRng, Arc<GuestMemory>, Arc<InterruptLine>) {
        let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
        let irq = Arc::new(InterruptLine::new(13).unwrap());
        let dev = VirtioRng::new(mem.clone(), irq.clone()).unwrap();

        let q = &dev.queues()[0];
        q.set_size(4);
        q.set_desc_low(DESC_ADDR as u32);
        q.set_avail_low(AVAIL_ADDR as u32);
        q.set_used_low(USED_ADDR as u32);
        q.set_ready(true);

        mem.write_u64(DESC_ADDR, BUF_ADDR).unwrap();
        mem.write_u32(DESC_ADDR + 8, len).unwrap();
        mem.write_u16(DESC_ADDR + 12, VIRTQ_DESC_F_WRITE).unwrap();
        mem.write_u16(DESC_ADDR + 14, 0).unwrap();

        mem.write_u16(AVAIL_ADDR + 4, 0).unwrap();
        mem.write_u16(AVAIL_ADDR + 2, 1).unwrap();
        q.set_notify();

        (dev, mem, irq)
    }

    #[test]
    fn test_published_length_matches_request() {
        let (mut dev, mem, irq) = rng_with_request(64);
        dev.notify(0);

        assert_eq!(mem.read_u16(USED_ADDR + 2).unwrap(), 1);
        assert_eq!(mem.read_u32(USED_ADDR + 4).unwrap(), 0, "head id");
        assert_eq!(mem.read_u32(USED_ADDR + 8).unwrap(), 64, "used length");
        assert!(irq.level());
    }

    #[test]
    fn test_no_request_no_used_entry() {
        let (mut dev, mem, irq) = rng_with_request(64);
        // Rewind the available index so nothing is pending.
        mem.write_u16(AVAIL_ADDR + 2, 0).unwrap();
        dev.notify(0);

        assert_eq!(mem.read_u16(USED_ADDR + 2).unwrap(), 0);
        assert!(!irq.level());
    }
}

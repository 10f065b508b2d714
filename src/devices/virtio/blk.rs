//! virtio-blk backend.
//!
//! One queue over a flat file of 512-byte sectors. Each request chain is
//! a 16-byte header descriptor, data descriptors, and a one-byte status
//! tail. Reads scatter `read_at` results into the device-writable
//! descriptors; writes gather the device-readable ones down to the file
//! and flush. GET_ID answers with the fixed disk identity string.
//!
//! Used lengths count only bytes written to guest-visible buffers: the
//! payload plus status byte for reads, the status byte alone for writes
//! and flushes. Unknown request types are logged and get no used entry at
//! all.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use log::{error, info, warn};

use super::queue::{Descriptor, Virtqueue};
use super::{VirtioDevice, VIRTIO_ID_BLOCK, VIRTIO_RING_F_EVENT_IDX};
use crate::boot::GuestMemory;
use crate::kvm::InterruptLine;

const SECTOR_SIZE: u64 = 512;

// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

// Status byte values.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;

// Feature bits.
const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;

/// Largest single segment we accept.
const SIZE_MAX: u32 = 1 << 20;

/// Largest number of segments per request.
const SEG_MAX: u32 = 128;

/// Identity returned for GET_ID, NUL-padded to the descriptor length.
const DISK_ID: &[u8] = b"kthxvmkthxvmkthxvmdisk";

pub struct VirtioBlk {
    disk: File,
    capacity: u64,

    mem: Arc<GuestMemory>,
    queues: Vec<Arc<Virtqueue>>,
    irq: Arc<InterruptLine>,

    config: [u8; 16],
    generation: u32,
}

impl VirtioBlk {
    pub fn new(
        path: &str,
        mem: Arc<GuestMemory>,
        irq: Arc<InterruptLine>,
    ) -> std::io::Result<Self> {
        let disk = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = disk.metadata()?.len() / SECTOR_SIZE;

        info!("virtio-blk: {} ({} sectors)", path, capacity);

        let mut config = [0u8; 16];
        config[0..8].copy_from_slice(&capacity.to_le_bytes());
        config[8..12].copy_from_slice(&SIZE_MAX.to_le_bytes());
        config[12..16].copy_from_slice(&SEG_MAX.to_le_bytes());

        Ok(Self {
            disk,
            capacity,
            queues: vec![Arc::new(Virtqueue::new(mem.clone()))],
            mem,
            irq,
            config,
            generation: 0,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn collect_chain(&self, queue: &Virtqueue, head: u16) -> Option<Vec<Descriptor>> {
        let mut descs = Vec::new();
        let mut desc = queue.desc(head)?;
        loop {
            descs.push(desc);
            if descs.len() > queue.size() as usize {
                warn!("virtio-blk: descriptor chain longer than the ring");
                return None;
            }
            match queue.chain_next(&desc) {
                Some(next) => desc = next,
                None => break,
            }
        }
        Some(descs)
    }

    fn handle_read(&self, mut sector: u64, data: &[Descriptor]) -> (u8, u32) {
        let mut total = 0u32;
        for desc in data {
            if !desc.is_write_only() {
                continue;
            }

            let mut buf = vec![0u8; desc.len as usize];
            if let Err(e) = self.disk.read_exact_at(&mut buf, sector * SECTOR_SIZE) {
                error!("virtio-blk: read at sector {sector}: {e}");
                return (VIRTIO_BLK_S_IOERR, total);
            }
            if let Err(e) = self.mem.write(desc.addr, &buf) {
                error!("virtio-blk: guest buffer write: {e}");
                return (VIRTIO_BLK_S_IOERR, total);
            }

            total += desc.len;
            sector += u64::from(desc.len) / SECTOR_SIZE;
        }
        (VIRTIO_BLK_S_OK, total)
    }

    fn handle_write(&self, mut sector: u64, data: &[Descriptor]) -> u8 {
        for desc in data {
            if desc.is_write_only() {
                continue;
            }

            let mut buf = vec![0u8; desc.len as usize];
            if let Err(e) = self.mem.read(desc.addr, &mut buf) {
                error!("virtio-blk: guest buffer read: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            if let Err(e) = self.disk.write_all_at(&buf, sector * SECTOR_SIZE) {
                error!("virtio-blk: write at sector {sector}: {e}");
                return VIRTIO_BLK_S_IOERR;
            }

            sector += u64::from(desc.len) / SECTOR_SIZE;
        }

        if let Err(e) = self.disk.sync_data() {
            error!("virtio-blk: sync after write: {e}");
            return VIRTIO_BLK_S_IOERR;
        }
        VIRTIO_BLK_S_OK
    }

    fn handle_get_id(&self, data: &[Descriptor]) -> (u8, u32) {
        let Some(desc) = data.iter().find(|d| d.is_write_only()) else {
            warn!("virtio-blk: GET_ID without a writable buffer");
            return (VIRTIO_BLK_S_IOERR, 0);
        };

        let mut id = vec![0u8; desc.len as usize];
        let len = DISK_ID.len().min(id.len());
        id[..len].copy_from_slice(&DISK_ID[..len]);

        if let Err(e) = self.mem.write(desc.addr, &id) {
            error!("virtio-blk: GET_ID buffer write: {e}");
            return (VIRTIO_BLK_S_IOERR, 0);
        }
        (VIRTIO_BLK_S_OK, desc.len)
    }

    /// Handle one chain. Returns the used length, or `None` for a request
    /// that gets no used entry.
    fn process_request(&mut self, queue: &Virtqueue, head: u16) -> Option<u32> {
        let descs = self.collect_chain(queue, head)?;
        if descs.len() < 2 {
            warn!("virtio-blk: request with only {} descriptors", descs.len());
            return None;
        }

        let mut header = [0u8; 16];
        if let Err(e) = self.mem.read(descs[0].addr, &mut header) {
            error!("virtio-blk: request header read: {e}");
            return None;
        }
        let req_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());

        let status_desc = descs[descs.len() - 1];
        if !status_desc.is_write_only() {
            warn!("virtio-blk: status descriptor is not writable");
            return None;
        }
        let data = &descs[1..descs.len() - 1];

        let (status, payload) = match req_type {
            VIRTIO_BLK_T_IN => self.handle_read(sector, data),
            VIRTIO_BLK_T_OUT => (self.handle_write(sector, data), 0),
            VIRTIO_BLK_T_FLUSH => match self.disk.sync_all() {
                Ok(()) => (VIRTIO_BLK_S_OK, 0),
                Err(e) => {
                    error!("virtio-blk: flush: {e}");
                    (VIRTIO_BLK_S_IOERR, 0)
                }
            },
            VIRTIO_BLK_T_GET_ID => self.handle_get_id(data),
            other => {
                warn!("virtio-blk: unhandled request type {other}");
                return None;
            }
        };

        if let Err(e) = self.mem.write_u8(status_desc.addr, status) {
            error!("virtio-blk: status byte write: {e}");
        }
        Some(payload + 1)
    }
}

impl VirtioDevice for VirtioBlk {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_BLOCK
    }

    fn device_features(&self) -> u64 {
        VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_RING_F_EVENT_IDX
    }

    fn queues(&self) -> &[Arc<Virtqueue>] {
        &self.queues
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let offset = offset as usize;
        if offset + data.len() > self.config.len() {
            warn!("virtio-blk: config read past the end at {offset:#x}");
            data.fill(0);
            return;
        }
        data.copy_from_slice(&self.config[offset..offset + data.len()]);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        if offset + data.len() > self.config.len() {
            warn!("virtio-blk: config write past the end at {offset:#x}");
            return;
        }
        self.config[offset..offset + data.len()].copy_from_slice(data);
        self.generation += 1;
    }

    fn config_generation(&self) -> u32 {
        self.generation
    }

    fn notify(&mut self, _queue_index: u32) {
        let queue = self.queues[0].clone();
        while let Some(head) = queue.next() {
            if let Some(len) = self.process_request(&queue, head) {
                let used_idx = queue.add_used(head, len);
                if queue.needs_interrupt(used_idx) {
                    if let Err(e) = self.irq.set_level(true) {
                        error!("virtio-blk: irq: {e}");
                    }
                }
            }
        }
    }
}

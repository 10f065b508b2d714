//! Split-virtqueue engine.
//!
//! The descriptor, available, and used rings live in guest memory; this
//! type holds only their guest physical addresses plus the consumer-side
//! bookkeeping, so one `Virtqueue` can be shared between the vCPU thread
//! (which programs the registers through the MMIO transport) and a device
//! worker (which consumes buffers). Registers are plain atomics;
//! `last_avail_idx` is only ever touched by the consumer.
//!
//! Ordering contract, matching x86 TSO plus compiler fences:
//! - `next()` issues an acquire fence before loading `avail.idx`, so the
//!   descriptor contents published with that index are visible.
//! - `add_used()` issues a release fence before touching the used ring and
//!   another before the `used.idx` store, so the guest can only observe
//!   the new index after the data buffers and the used element.

use std::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::boot::GuestMemory;

/// Largest ring this device model accepts.
pub const QUEUE_SIZE_MAX: u16 = 512;

/// Descriptor continues into `next`.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;

/// Buffer is device-writable (device-readable otherwise).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// One entry of the descriptor ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub const SIZE: u64 = 16;

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

pub struct Virtqueue {
    mem: Arc<GuestMemory>,

    size: AtomicU16,
    ready: AtomicBool,
    event_idx: AtomicBool,

    desc_addr: AtomicU64,
    avail_addr: AtomicU64,
    used_addr: AtomicU64,

    // Consumer-owned; atomic only so the struct stays Sync.
    last_avail_idx: AtomicU16,
    notify: AtomicU64,
}

fn set_low(addr: &AtomicU64, value: u32) {
    let cur = addr.load(Ordering::Relaxed);
    addr.store((cur & 0xffff_ffff_0000_0000) | u64::from(value), Ordering::Relaxed);
}

fn set_high(addr: &AtomicU64, value: u32) {
    let cur = addr.load(Ordering::Relaxed);
    addr.store((cur & 0x0000_0000_ffff_ffff) | (u64::from(value) << 32), Ordering::Relaxed);
}

impl Virtqueue {
    pub fn new(mem: Arc<GuestMemory>) -> Self {
        Self {
            mem,
            size: AtomicU16::new(0),
            ready: AtomicBool::new(false),
            event_idx: AtomicBool::new(false),
            desc_addr: AtomicU64::new(0),
            avail_addr: AtomicU64::new(0),
            used_addr: AtomicU64::new(0),
            last_avail_idx: AtomicU16::new(0),
            notify: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u16 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn set_size(&self, size: u16) {
        if size > QUEUE_SIZE_MAX || !size.is_power_of_two() {
            warn!("virtqueue: rejecting queue size {size}");
            return;
        }
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn set_event_idx(&self, enabled: bool) {
        self.event_idx.store(enabled, Ordering::Relaxed);
    }

    pub fn set_desc_low(&self, value: u32) {
        set_low(&self.desc_addr, value);
    }

    pub fn set_desc_high(&self, value: u32) {
        set_high(&self.desc_addr, value);
    }

    pub fn set_avail_low(&self, value: u32) {
        set_low(&self.avail_addr, value);
    }

    pub fn set_avail_high(&self, value: u32) {
        set_high(&self.avail_addr, value);
    }

    pub fn set_used_low(&self, value: u32) {
        set_low(&self.used_addr, value);
    }

    pub fn set_used_high(&self, value: u32) {
        set_high(&self.used_addr, value);
    }

    /// Record a guest notify; consumed by `next()` when the ring drains.
    pub fn set_notify(&self) {
        self.notify.fetch_add(1, Ordering::AcqRel);
    }

    /// Back to the pre-driver state (device reset).
    pub fn reset(&self) {
        self.ready.store(false, Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
        self.event_idx.store(false, Ordering::Relaxed);
        self.desc_addr.store(0, Ordering::Relaxed);
        self.avail_addr.store(0, Ordering::Relaxed);
        self.used_addr.store(0, Ordering::Relaxed);
        self.last_avail_idx.store(0, Ordering::Relaxed);
        self.notify.store(0, Ordering::Relaxed);
    }

    /// Pop the next available descriptor head, if the queue is ready, a
    /// notify is pending, and the guest has published one.
    pub fn next(&self) -> Option<u16> {
        let size = self.size();
        if !self.is_ready() || size == 0 || self.notify.load(Ordering::Acquire) == 0 {
            return None;
        }

        fence(Ordering::Acquire);

        let avail = self.avail_addr.load(Ordering::Relaxed);
        let avail_idx = match self.mem.read_u16(avail + 2) {
            Ok(idx) => idx,
            Err(e) => {
                error!("virtqueue: avail index read failed: {e}");
                return None;
            }
        };

        let last = self.last_avail_idx.load(Ordering::Relaxed);
        if avail_idx == last {
            // Drained; the pending notify is spent.
            self.notify.store(0, Ordering::Release);
            return None;
        }

        let slot = avail + 4 + 2 * u64::from(last % size);
        let head = match self.mem.read_u16(slot) {
            Ok(head) => head,
            Err(e) => {
                error!("virtqueue: avail ring read failed: {e}");
                return None;
            }
        };

        self.last_avail_idx.store(last.wrapping_add(1), Ordering::Relaxed);
        Some(head)
    }

    /// Read a descriptor from the descriptor ring.
    pub fn desc(&self, index: u16) -> Option<Descriptor> {
        let size = self.size();
        if index >= size {
            warn!("virtqueue: descriptor index {index} out of range (size {size})");
            return None;
        }

        let addr = self.desc_addr.load(Ordering::Relaxed) + u64::from(index) * Descriptor::SIZE;
        let mut buf = [0u8; Descriptor::SIZE as usize];
        if let Err(e) = self.mem.read(addr, &mut buf) {
            error!("virtqueue: descriptor read failed: {e}");
            return None;
        }

        Some(Descriptor {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        })
    }

    /// Follow a descriptor chain one hop.
    pub fn chain_next(&self, desc: &Descriptor) -> Option<Descriptor> {
        if !desc.has_next() {
            return None;
        }
        self.desc(desc.next)
    }

    /// Publish a completed chain: used element first, then the index, each
    /// behind a release fence. Returns the new used index.
    pub fn add_used(&self, head: u16, len: u32) -> u16 {
        let size = self.size();
        if size == 0 {
            return 0;
        }

        let used = self.used_addr.load(Ordering::Relaxed);
        let used_idx = match self.mem.read_u16(used + 2) {
            Ok(idx) => idx,
            Err(e) => {
                error!("virtqueue: used index read failed: {e}");
                return 0;
            }
        };

        fence(Ordering::Release);

        let slot = used + 4 + 8 * u64::from(used_idx % size);
        let publish = self
            .mem
            .write_u32(slot, u32::from(head))
            .and_then(|_| self.mem.write_u32(slot + 4, len));
        if let Err(e) = publish {
            error!("virtqueue: used ring write failed: {e}");
            return used_idx;
        }

        fence(Ordering::Release);

        let new_idx = used_idx.wrapping_add(1);
        if let Err(e) = self.mem.write_u16(used + 2, new_idx) {
            error!("virtqueue: used index write failed: {e}");
            return used_idx;
        }
        new_idx
    }

    /// Whether publishing `new_used_idx` should raise the interrupt.
    ///
    /// With EVENT_IDX negotiated the guest names the used index it wants to
    /// be interrupted for in `avail.used_event`; the edge is crossing that
    /// value exactly. Without the feature every publish interrupts.
    pub fn needs_interrupt(&self, new_used_idx: u16) -> bool {
        if !self.event_idx.load(Ordering::Relaxed) {
            return true;
        }

        let avail = self.avail_addr.load(Ordering::Relaxed);
        let used_event_addr = avail + 4 + 2 * u64::from(self.size());
        match self.mem.read_u16(used_event_addr) {
            Ok(used_event) => new_used_idx.wrapping_sub(1) == used_event,
            Err(e) => {
                error!("virtqueue: used_event read failed: {e}");
                true
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_last_avail(&self, value: u16) {
        self.last_avail_idx.store(value, Ordering::Relaxed);
    }
}

//! virtio-mmio transport (v2 register layout).
//!
//! One transport instance wraps one backend and owns the generic device
//! state: status byte, feature selectors, negotiated driver features, and
//! the queue selector. Ring geometry writes go straight to the selected
//! queue; notify writes are forwarded to the backend after bumping the
//! queue's notify count; config-space accesses above 0x100 pass through.
//!
//! The interrupt-status register reflects the interrupt line itself, so
//! the guest can only observe it set after a used entry was published and
//! the line raised. Acknowledging with bit 0 lowers the line.

use std::sync::Arc;

use log::{debug, error, warn};

use super::queue::QUEUE_SIZE_MAX;
use super::*;
use crate::devices::bus::BusDevice;
use crate::kvm::InterruptLine;

/// Size of one device's MMIO window.
pub const VIRTIO_MMIO_REGION_SIZE: u64 = 0x1000;

pub struct MmioTransport {
    device: Box<dyn VirtioDevice>,
    irq: Arc<InterruptLine>,

    status: u32,
    device_feature_sel: bool,
    driver_feature_sel: bool,
    driver_features: u64,
    queue_sel: u32,
}

impl MmioTransport {
    pub fn new(device: Box<dyn VirtioDevice>, irq: Arc<InterruptLine>) -> Self {
        Self {
            device,
            irq,
            status: 0,
            device_feature_sel: false,
            driver_feature_sel: false,
            driver_features: 0,
            queue_sel: 0,
        }
    }

    fn device_features(&self) -> u64 {
        self.device.device_features() | VIRTIO_F_VERSION_1
    }

    fn selected_queue(&self) -> Option<&Arc<Virtqueue>> {
        let queue = self.device.queues().get(self.queue_sel as usize);
        if queue.is_none() {
            warn!(
                "virtio-mmio: device {} has no queue {}",
                self.device.device_id(),
                self.queue_sel
            );
        }
        queue
    }

    fn reset_device(&mut self) {
        for queue in self.device.queues() {
            queue.reset();
        }
        self.device.reset();
        self.status = 0;
        self.device_feature_sel = false;
        self.driver_feature_sel = false;
        self.driver_features = 0;
        self.queue_sel = 0;
        if let Err(e) = self.irq.set_level(false) {
            error!("virtio-mmio: lowering irq on reset: {e}");
        }
        debug!("virtio-mmio: device {} reset", self.device.device_id());
    }

    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.reset_device();
            return;
        }

        let newly_set = value & !self.status;
        self.status = value;

        if newly_set & STATUS_FEATURES_OK != 0 {
            let negotiated = self.device_features() & self.driver_features;
            let event_idx = negotiated & VIRTIO_RING_F_EVENT_IDX != 0;
            for queue in self.device.queues() {
                queue.set_event_idx(event_idx);
            }
            debug!(
                "virtio-mmio: device {} negotiated features {:#x}",
                self.device.device_id(),
                negotiated
            );
        }

        if newly_set & STATUS_DRIVER_OK != 0 {
            debug!("virtio-mmio: device {} driver ready", self.device.device_id());
        }
    }

    fn read_register(&self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => self.device.device_id(),
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => {
                let shift = if self.device_feature_sel { 32 } else { 0 };
                (self.device_features() >> shift) as u32
            }
            MMIO_QUEUE_NUM_MAX => u32::from(QUEUE_SIZE_MAX),
            MMIO_QUEUE_READY => self.selected_queue().map_or(0, |q| q.is_ready() as u32),
            MMIO_INTERRUPT_STATUS => {
                if self.irq.level() {
                    INT_USED_BUFFER
                } else {
                    0
                }
            }
            MMIO_CONFIG_GENERATION => self.device.config_generation(),
            MMIO_STATUS => self.status,

            MMIO_DEVICE_FEATURES_SEL
            | MMIO_DRIVER_FEATURES
            | MMIO_DRIVER_FEATURES_SEL
            | MMIO_QUEUE_SEL
            | MMIO_QUEUE_NUM
            | MMIO_QUEUE_NOTIFY
            | MMIO_INTERRUPT_ACK
            | MMIO_QUEUE_DESC_LOW
            | MMIO_QUEUE_DESC_HIGH
            | MMIO_QUEUE_AVAIL_LOW
            | MMIO_QUEUE_AVAIL_HIGH
            | MMIO_QUEUE_USED_LOW
            | MMIO_QUEUE_USED_HIGH => {
                warn!("virtio-mmio: read of write-only register {offset:#x}");
                0
            }

            _ => {
                warn!("virtio-mmio: unhandled register read at {offset:#x}");
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.device_feature_sel = value == 1,
            MMIO_DRIVER_FEATURES => {
                if self.driver_feature_sel {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff) | (u64::from(value) << 32);
                } else {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff_0000_0000) | u64::from(value);
                }
            }
            MMIO_DRIVER_FEATURES_SEL => self.driver_feature_sel = value == 1,

            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => {
                if let Some(queue) = self.selected_queue() {
                    queue.set_size(value as u16);
                }
            }
            MMIO_QUEUE_READY => {
                if let Some(queue) = self.selected_queue() {
                    queue.set_ready(value != 0);
                }
            }
            MMIO_QUEUE_NOTIFY => {
                if (value as usize) < self.device.queues().len() {
                    self.device.queues()[value as usize].set_notify();
                    self.device.notify(value);
                } else {
                    warn!("virtio-mmio: notify for unknown queue {value}");
                }
            }

            MMIO_QUEUE_DESC_LOW => self.with_queue(|q| q.set_desc_low(value)),
            MMIO_QUEUE_DESC_HIGH => self.with_queue(|q| q.set_desc_high(value)),
            MMIO_QUEUE_AVAIL_LOW => self.with_queue(|q| q.set_avail_low(value)),
            MMIO_QUEUE_AVAIL_HIGH => self.with_queue(|q| q.set_avail_high(value)),
            MMIO_QUEUE_USED_LOW => self.with_queue(|q| q.set_used_low(value)),
            MMIO_QUEUE_USED_HIGH => self.with_queue(|q| q.set_used_high(value)),

            MMIO_INTERRUPT_ACK => {
                if value & INT_USED_BUFFER != 0 {
                    if let Err(e) = self.irq.set_level(false) {
                        error!("virtio-mmio: interrupt ack: {e}");
                    }
                }
            }

            MMIO_STATUS => self.write_status(value),

            MMIO_MAGIC_VALUE
            | MMIO_VERSION
            | MMIO_DEVICE_ID
            | MMIO_VENDOR_ID
            | MMIO_DEVICE_FEATURES
            | MMIO_QUEUE_NUM_MAX
            | MMIO_INTERRUPT_STATUS
            | MMIO_CONFIG_GENERATION => {
                warn!("virtio-mmio: write of read-only register {offset:#x}");
            }

            _ => {
                warn!("virtio-mmio: unhandled register write at {offset:#x} value {value:#x}");
            }
        }
    }

    fn with_queue(&self, f: impl FnOnce(&Virtqueue)) {
        if let Some(queue) = self.selected_queue() {
            f(queue);
        }
    }
}

impl BusDevice for MmioTransport {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        if offset >= MMIO_CONFIG {
            self.device.read_config(offset - MMIO_CONFIG, data);
            return;
        }

        let value = self.read_register(offset & !0x3);
        let bytes = value.to_le_bytes();
        let start = (offset & 0x3) as usize;
        let len = data.len().min(4 - start);
        data[..len].copy_from_slice(&bytes[start..start + len]);
        if len < data.len() {
            data[len..].fill(0);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if offset >= MMIO_CONFIG {
            self.device.write_config(offset - MMIO_CONFIG, data);
            return;
        }

        if data.len() != 4 || offset & 0x3 != 0 {
            warn!(
                "virtio-mmio: unaligned register write at {offset:#x} len {}",
                data.len()
            );
            return;
        }

        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::GuestMemory;

    struct TestDevice {
        queues: Vec<Arc<Virtqueue>>,
        config: [u8; 8],
        generation: u32,
    }

    impl TestDevice {
        fn new(mem: Arc<GuestMemory>) -> Self {
            Self {
                queues: vec![Arc::new(Virtqueue::new(mem))],
                config: *b"testdev\0",
                generation: 0,
            }
        }
    }

    impl VirtioDevice for TestDevice {
        fn device_id(&self) -> u32 {
            0x7f
        }

        fn device_features(&self) -> u64 {
            VIRTIO_RING_F_EVENT_IDX
        }

        fn queues(&self) -> &[Arc<Virtqueue>] {
            &self.queues
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            for (i, b) in data.iter_mut().enumerate() {
                *b = *self.config.get(offset as usize + i).unwrap_or(&0);
            }
        }

        fn write_config(&mut self, offset: u64, data: &[u8]) {
            for (i, &b) in data.iter().enumerate() {
                if let Some(slot) = self.config.get_mut(offset as usize + i) {
                    *slot = b;
                }
            }
            self.generation += 1;
        }

        fn config_generation(&self) -> u32 {
            self.generation
        }

        fn notify(&mut self, queue_index: u32) {
            // Leave a fingerprint a test can read back via config space.
            self.config[7] = queue_index as u8 + 1;
        }
    }

    fn transport() -> (MmioTransport, Arc<InterruptLine>) {
        let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
        let irq = Arc::new(InterruptLine::new(12).unwrap());
        let dev = TestDevice::new(mem);
        (MmioTransport::new(Box::new(dev), irq.clone()), irq)
    }

    fn read_u32(t: &mut MmioTransport, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        t.read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    fn write_u32(t: &mut MmioTransport, offset: u64, value: u32) {
        t.write(offset, &value.to_le_bytes());
    }

    #[test]
    fn test_identity_registers() {
        let (mut t, _) = transport();
        assert_eq!(read_u32(&mut t, MMIO_MAGIC_VALUE), 0x7472_6976);
        assert_eq!(read_u32(&mut t, MMIO_VERSION), 2);
        assert_eq!(read_u32(&mut t, MMIO_DEVICE_ID), 0x7f);
        assert_eq!(read_u32(&mut t, MMIO_VENDOR_ID), VIRTIO_VENDOR_ID);
        assert_eq!(read_u32(&mut t, MMIO_QUEUE_NUM_MAX), 512);
    }

    #[test]
    fn test_feature_windows() {
        let (mut t, _) = transport();
        // Low window: EVENT_IDX (bit 29).
        assert_eq!(read_u32(&mut t, MMIO_DEVICE_FEATURES), 1 << 29);
        // High window: VERSION_1 (bit 32).
        write_u32(&mut t, MMIO_DEVICE_FEATURES_SEL, 1);
        assert_eq!(read_u32(&mut t, MMIO_DEVICE_FEATURES), 1);
    }

    #[test]
    fn test_event_idx_latched_at_features_ok() {
        let (mut t, _) = transport();

        // Lay out an avail ring so used_event is readable.
        let q = t.device.queues()[0].clone();
        q.set_size(4);
        write_u32(&mut t, MMIO_QUEUE_AVAIL_LOW, 0x2000);

        write_u32(&mut t, MMIO_DRIVER_FEATURES, 1 << 29);
        write_u32(&mut t, MMIO_DRIVER_FEATURES_SEL, 1);
        write_u32(&mut t, MMIO_DRIVER_FEATURES, 1);
        write_u32(
            &mut t,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
        );

        // used_event = 0: publishing index 1 interrupts, index 2 does not.
        assert!(q.needs_interrupt(1));
        assert!(!q.needs_interrupt(2));
    }

    #[test]
    fn test_notify_forwarded() {
        let (mut t, _) = transport();
        let mut buf = [0u8; 1];

        write_u32(&mut t, MMIO_QUEUE_NOTIFY, 0);
        t.read(MMIO_CONFIG + 7, &mut buf);
        assert_eq!(buf[0], 1, "backend saw the notify for queue 0");

        // A notify for a queue the device does not have is dropped.
        write_u32(&mut t, MMIO_QUEUE_NOTIFY, 5);
        t.read(MMIO_CONFIG + 7, &mut buf);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_interrupt_status_and_ack() {
        let (mut t, irq) = transport();
        assert_eq!(read_u32(&mut t, MMIO_INTERRUPT_STATUS), 0);

        irq.set_level(true).unwrap();
        assert_eq!(read_u32(&mut t, MMIO_INTERRUPT_STATUS), INT_USED_BUFFER);

        write_u32(&mut t, MMIO_INTERRUPT_ACK, 1);
        assert!(!irq.level());
        assert_eq!(read_u32(&mut t, MMIO_INTERRUPT_STATUS), 0);
    }

    #[test]
    fn test_status_zero_resets() {
        let (mut t, irq) = transport();
        let q = t.device.queues()[0].clone();

        write_u32(&mut t, MMIO_QUEUE_NUM, 4);
        write_u32(&mut t, MMIO_QUEUE_READY, 1);
        write_u32(&mut t, MMIO_STATUS, STATUS_ACKNOWLEDGE);
        irq.set_level(true).unwrap();
        assert!(q.is_ready());
        assert_eq!(read_u32(&mut t, MMIO_QUEUE_READY), 1);

        write_u32(&mut t, MMIO_STATUS, 0);
        assert!(!q.is_ready());
        assert_eq!(q.size(), 0);
        assert!(!irq.level());
        assert_eq!(read_u32(&mut t, MMIO_STATUS), 0);
    }

    #[test]
    fn test_config_space_forwarding() {
        let (mut t, _) = transport();
        let mut buf = [0u8; 4];
        t.read(MMIO_CONFIG, &mut buf);
        assert_eq!(&buf, b"test");

        assert_eq!(read_u32(&mut t, MMIO_CONFIG_GENERATION), 0);
        t.write(MMIO_CONFIG + 4, b"beef");
        assert_eq!(read_u32(&mut t, MMIO_CONFIG_GENERATION), 1);
        t.read(MMIO_CONFIG + 4, &mut buf);
        assert_eq!(&buf, b"beef");
    }

    #[test]
    fn test_queue_address_halves() {
        let (mut t, _) = transport();
        let q = t.device.queues()[0].clone();
        q.set_size(4);

        write_u32(&mut t, MMIO_QUEUE_DESC_LOW, 0x1000);
        write_u32(&mut t, MMIO_QUEUE_DESC_HIGH, 0);
        write_u32(&mut t, MMIO_QUEUE_AVAIL_LOW, 0x2000);
        write_u32(&mut t, MMIO_QUEUE_USED_LOW, 0x3000);
        q.set_ready(true);

        // The composed used address is where add_used publishes.
        let new_idx = q.add_used(1, 8);
        assert_eq!(new_idx, 1);
    }
}

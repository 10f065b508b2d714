//! Paravirtual (virtio) device infrastructure.
//!
//! The pieces line up as: guest MMIO access → [`MmioTransport`] register
//! map → [`VirtioDevice`] backend → [`Virtqueue`] ring traffic in guest
//! memory → interrupt line. Backends implement only the small contract
//! below; status bytes, feature selectors, and queue selection are
//! transport state.

pub mod blk;
pub mod mmio;
pub mod net;
pub mod queue;
pub mod rng;

pub use mmio::MmioTransport;
pub use queue::Virtqueue;

use std::sync::Arc;

// Register offsets of the virtio-mmio v2 layout.
pub const MMIO_MAGIC_VALUE: u64 = 0x000;
pub const MMIO_VERSION: u64 = 0x004;
pub const MMIO_DEVICE_ID: u64 = 0x008;
pub const MMIO_VENDOR_ID: u64 = 0x00c;
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const MMIO_QUEUE_SEL: u64 = 0x030;
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;
pub const MMIO_QUEUE_NUM: u64 = 0x038;
pub const MMIO_QUEUE_READY: u64 = 0x044;
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;
pub const MMIO_STATUS: u64 = 0x070;
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
pub const MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
pub const MMIO_CONFIG_GENERATION: u64 = 0x0fc;
pub const MMIO_CONFIG: u64 = 0x100;

/// Reads as "virt", little-endian.
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_MMIO_VERSION: u32 = 2;

/// "KTHX", little-endian.
pub const VIRTIO_VENDOR_ID: u32 = 0x4b54_4858;

// Device status bits, in negotiation order.
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;

/// Interrupt-status bit for a used-ring update.
pub const INT_USED_BUFFER: u32 = 0x1;

// Transport-independent feature bits.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;

// Well-known device ids.
pub const VIRTIO_ID_NET: u32 = 1;
pub const VIRTIO_ID_BLOCK: u32 = 2;
pub const VIRTIO_ID_RNG: u32 = 4;

/// The backend contract behind the MMIO transport.
///
/// A backend owns its queues (count fixed at construction) and its config
/// space; everything else about the transport register file is handled for
/// it. `notify` runs on the vCPU thread and may service the queue inline
/// or wake a worker owned by the device.
pub trait VirtioDevice: Send {
    fn device_id(&self) -> u32;

    /// Advertised feature bits; VERSION_1 always included.
    fn device_features(&self) -> u64;

    fn queues(&self) -> &[Arc<Virtqueue>];

    fn read_config(&self, offset: u64, data: &mut [u8]);

    fn write_config(&mut self, offset: u64, data: &[u8]);

    fn config_generation(&self) -> u32 {
        0
    }

    /// The guest wrote the notify register for `queue_index`.
    fn notify(&mut self, queue_index: u32);

    /// Device-specific reset work beyond the queues (which the transport
    /// resets itself).
    fn reset(&mut self) {}
}

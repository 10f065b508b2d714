//! Guest-visible devices and the buses that route to them.

pub mod bus;
pub mod i8042;
pub mod rtc;
pub mod serial;
pub mod virtio;

pub use bus::{Bus, BusDevice};
pub use i8042::{I8042, I8042_BASE, I8042_WIDTH};
pub use rtc::{Rtc, RTC_BASE, RTC_WIDTH};
pub use serial::Serial;

use thiserror::Error;

/// Port windows and IRQ lines for ttyS0..ttyS3.
pub const SERIAL_PORTS: [(u64, u32); 4] = [(0x3f8, 4), (0x2f8, 3), (0x3e8, 4), (0x2e8, 3)];

/// Size of one 16550 register window.
pub const SERIAL_WIDTH: u64 = 8;

/// GSI for the i8042 keyboard interrupt.
pub const I8042_IRQ: u32 = 1;

/// BIOS POST diagnostics port; written during boot, safely ignored.
pub const BIOS_POST_PORT: u64 = 0x80;

/// First paravirtual device window; device k sits at base + 0x1000 * k.
pub const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;

/// Errors raised while assembling the device tree.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("endpoint [{base:#x}, {base:#x}+{width:#x}) is empty or overlaps an existing range")]
    RangeOverlap { base: u64, width: u64 },
}

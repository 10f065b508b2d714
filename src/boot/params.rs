//! Zero page (`boot_params`), E820 map, and kernel command line.
//!
//! The zero page is built from scratch rather than copied from a kernel
//! header: for direct long-mode entry only a handful of fields matter, and
//! the kernel validates exactly the ones written here (boot flag, header
//! magic, loader type, command-line pointer, E820 table).

use log::info;

use super::layout;
use super::memory::{GuestMemory, MMIO_HOLE_START};
use super::BootError;

const ZERO_PAGE_SIZE: usize = 4096;

const KERNEL_BOOT_FLAG_MAGIC: u16 = 0xaa55;
const KERNEL_HDR_MAGIC: u32 = 0x5372_6448;
const KERNEL_LOADER_OTHER: u8 = 0xff;
const KERNEL_MIN_ALIGNMENT_BYTES: u32 = 0x0100_0000;

/// Byte offsets into `boot_params`, per the x86 boot protocol.
mod offsets {
    pub const E820_ENTRIES: u64 = 0x1e8;
    pub const BOOT_FLAG: u64 = 0x1fe;
    pub const HEADER: u64 = 0x202;
    pub const TYPE_OF_LOADER: u64 = 0x210;
    pub const CMD_LINE_PTR: u64 = 0x228;
    pub const KERNEL_ALIGNMENT: u64 = 0x230;
    pub const CMDLINE_SIZE: u64 = 0x238;
    pub const E820_TABLE: u64 = 0x2d0;
}

const E820_ENTRY_SIZE: u64 = 20;

#[repr(u32)]
#[derive(Clone, Copy)]
enum E820Type {
    Ram = 1,
}

/// Populate the zero page and write the command line.
pub fn setup_boot_params(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    memory.write(layout::ZERO_PAGE_START, &[0u8; ZERO_PAGE_SIZE])?;

    let base = layout::ZERO_PAGE_START;
    memory.write_u16(base + offsets::BOOT_FLAG, KERNEL_BOOT_FLAG_MAGIC)?;
    memory.write_u32(base + offsets::HEADER, KERNEL_HDR_MAGIC)?;
    memory.write_u8(base + offsets::TYPE_OF_LOADER, KERNEL_LOADER_OTHER)?;
    memory.write_u32(base + offsets::CMD_LINE_PTR, layout::CMDLINE_START as u32)?;
    memory.write_u32(base + offsets::KERNEL_ALIGNMENT, KERNEL_MIN_ALIGNMENT_BYTES)?;
    memory.write_u32(base + offsets::CMDLINE_SIZE, cmdline.len() as u32)?;

    setup_cmdline(memory, cmdline)?;

    let entries = setup_e820_map(memory)?;
    memory.write_u8(base + offsets::E820_ENTRIES, entries)?;

    info!(
        "boot params at {:#x}, cmdline at {:#x}, {} e820 entries",
        base,
        layout::CMDLINE_START,
        entries
    );

    Ok(())
}

fn setup_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }

    memory.write(layout::CMDLINE_START, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE_START + cmdline.len() as u64, 0)?;

    info!("kernel command line: {}", cmdline);
    Ok(())
}

/// Write the E820 map: conventional low memory, RAM from 1 MiB up to the
/// MMIO hole, and whatever moved above 4 GiB.
fn setup_e820_map(memory: &GuestMemory) -> Result<u8, BootError> {
    let table = layout::ZERO_PAGE_START + offsets::E820_TABLE;
    let mut idx = 0u64;

    let mut push = |memory: &GuestMemory, base: u64, size: u64, kind: E820Type| {
        let addr = table + idx * E820_ENTRY_SIZE;
        memory.write_u64(addr, base)?;
        memory.write_u64(addr + 8, size)?;
        memory.write_u32(addr + 16, kind as u32)?;
        idx += 1;
        Ok::<(), BootError>(())
    };

    push(memory, 0, layout::EBDA_START, E820Type::Ram)?;

    let low_end = memory.size().min(MMIO_HOLE_START);
    push(
        memory,
        layout::HIMEM_START,
        low_end - layout::HIMEM_START,
        E820Type::Ram,
    )?;

    if let Some((base, size)) = memory.high_region() {
        push(memory, base, size, E820Type::Ram)?;
    }

    Ok(idx as u8)
}

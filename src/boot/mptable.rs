//! MP (MultiProcessor) table generation.
//!
//! The MP table is how this VMM tells the kernel about its processors and
//! interrupt wiring: N processors (CPU 0 as bootstrap), one ISA bus, one
//! I/O APIC, and the two local interrupt lines (LINT0 wired as ExtINT,
//! LINT1 as NMI). It lives in the EBDA at 0x9fc00, floating pointer first,
//! configuration table right behind it.
//!
//! Both the floating pointer and the configuration table carry an 8-bit
//! checksum chosen so the bytes of each structure sum to zero mod 256.

use log::info;

use super::layout::EBDA_START;
use super::memory::GuestMemory;
use super::BootError;

const LOCAL_APIC_ADDR: u32 = 0xfee0_0000;
const IO_APIC_ADDR: u32 = 0xfec0_0000;
const APIC_VERSION: u8 = 0x14;

const MP_SIGNATURE: [u8; 4] = *b"_MP_";
const MPC_SIGNATURE: [u8; 4] = *b"PCMP";
const MP_SPEC_REVISION: u8 = 4;

const MP_PROCESSOR: u8 = 0;
const MP_BUS: u8 = 1;
const MP_IOAPIC: u8 = 2;
const MP_LINTSRC: u8 = 4;

const CPU_ENABLED: u8 = 0x01;
const CPU_BOOTPROCESSOR: u8 = 0x02;

const CPU_SIGNATURE: u32 = 0x600;
const CPU_FEATURES: u32 = 0x201; // APIC + FPU

const INT_TYPE_NMI: u8 = 1;
const INT_TYPE_EXTINT: u8 = 3;

const MP_IRQPOL_DEFAULT: u16 = 0;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpFloatingPointer {
    signature: [u8; 4],
    physptr: u32,
    length: u8,
    spec_rev: u8,
    checksum: u8,
    feature1: u8,
    feature2: u8,
    feature3: [u8; 3],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpConfigTable {
    signature: [u8; 4],
    length: u16,
    spec_rev: u8,
    checksum: u8,
    oem_id: [u8; 8],
    product_id: [u8; 12],
    oem_table_ptr: u32,
    oem_table_size: u16,
    entry_count: u16,
    lapic_addr: u32,
    ext_table_length: u16,
    ext_table_checksum: u8,
    reserved: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpProcessorEntry {
    entry_type: u8,
    apic_id: u8,
    apic_version: u8,
    cpu_flags: u8,
    cpu_signature: u32,
    feature_flags: u32,
    reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpBusEntry {
    entry_type: u8,
    bus_id: u8,
    bus_type: [u8; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpIoApicEntry {
    entry_type: u8,
    apic_id: u8,
    apic_version: u8,
    flags: u8,
    apic_addr: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpLocalIntSrcEntry {
    entry_type: u8,
    int_type: u8,
    int_flag: u16,
    src_bus_id: u8,
    src_bus_irq: u8,
    dst_apic_id: u8,
    dst_apic_lint: u8,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // Structures here are repr(C, packed) and contain no padding.
    unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    }
}

/// The byte that makes `data` plus the checksum sum to zero mod 256.
fn compute_checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Build the MP floating pointer and configuration table in the EBDA.
pub fn setup_mptable(memory: &GuestMemory, ncpus: u8) -> Result<(), BootError> {
    let fp_size = core::mem::size_of::<MpFloatingPointer>();
    let header_size = core::mem::size_of::<MpConfigTable>();
    let table_addr = EBDA_START + fp_size as u64;

    let mut table = Vec::with_capacity(256);
    table.resize(header_size, 0u8);
    let mut entry_count = 0u16;

    for cpu_id in 0..ncpus {
        let flags = CPU_ENABLED | if cpu_id == 0 { CPU_BOOTPROCESSOR } else { 0 };
        table.extend_from_slice(as_bytes(&MpProcessorEntry {
            entry_type: MP_PROCESSOR,
            apic_id: cpu_id,
            apic_version: APIC_VERSION,
            cpu_flags: flags,
            cpu_signature: CPU_SIGNATURE,
            feature_flags: CPU_FEATURES,
            reserved: [0; 2],
        }));
        entry_count += 1;
    }

    let isa_bus_id = 0;
    table.extend_from_slice(as_bytes(&MpBusEntry {
        entry_type: MP_BUS,
        bus_id: isa_bus_id,
        bus_type: *b"ISA   ",
    }));
    entry_count += 1;

    table.extend_from_slice(as_bytes(&MpIoApicEntry {
        entry_type: MP_IOAPIC,
        apic_id: ncpus + 1,
        apic_version: APIC_VERSION,
        flags: 1,
        apic_addr: IO_APIC_ADDR,
    }));
    entry_count += 1;

    table.extend_from_slice(as_bytes(&MpLocalIntSrcEntry {
        entry_type: MP_LINTSRC,
        int_type: INT_TYPE_EXTINT,
        int_flag: MP_IRQPOL_DEFAULT,
        src_bus_id: isa_bus_id,
        src_bus_irq: 0,
        dst_apic_id: 0,
        dst_apic_lint: 0,
    }));
    entry_count += 1;

    table.extend_from_slice(as_bytes(&MpLocalIntSrcEntry {
        entry_type: MP_LINTSRC,
        int_type: INT_TYPE_NMI,
        int_flag: MP_IRQPOL_DEFAULT,
        src_bus_id: isa_bus_id,
        src_bus_irq: 0,
        dst_apic_id: 0xff,
        dst_apic_lint: 1,
    }));
    entry_count += 1;

    let header = MpConfigTable {
        signature: MPC_SIGNATURE,
        length: table.len() as u16,
        spec_rev: MP_SPEC_REVISION,
        checksum: 0,
        oem_id: *b"KTHXVM  ",
        product_id: *b"0.1         ",
        oem_table_ptr: 0,
        oem_table_size: 0,
        entry_count,
        lapic_addr: LOCAL_APIC_ADDR,
        ext_table_length: 0,
        ext_table_checksum: 0,
        reserved: 0,
    };
    table[..header_size].copy_from_slice(as_bytes(&header));
    table[7] = compute_checksum(&table);

    memory.write(table_addr, &table)?;

    let mut fp = MpFloatingPointer {
        signature: MP_SIGNATURE,
        physptr: table_addr as u32,
        length: 1,
        spec_rev: MP_SPEC_REVISION,
        checksum: 0,
        feature1: 0,
        feature2: 0,
        feature3: [0; 3],
    };
    fp.checksum = compute_checksum(as_bytes(&fp));
    memory.write(EBDA_START, as_bytes(&fp))?;

    info!(
        "mptable at {:#x}: {} entries for {} cpu(s)",
        EBDA_START, entry_count, ncpus
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_sum(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(core::mem::size_of::<MpFloatingPointer>(), 16);
        assert_eq!(core::mem::size_of::<MpConfigTable>(), 44);
        assert_eq!(core::mem::size_of::<MpProcessorEntry>(), 20);
        assert_eq!(core::mem::size_of::<MpBusEntry>(), 8);
        assert_eq!(core::mem::size_of::<MpIoApicEntry>(), 8);
        assert_eq!(core::mem::size_of::<MpLocalIntSrcEntry>(), 8);
    }

    #[test]
    fn test_checksum() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let checksum = compute_checksum(&data);
        assert_eq!(byte_sum(&data).wrapping_add(checksum), 0);
    }

    #[test]
    fn test_table_checksums_in_memory() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        setup_mptable(&mem, 1).unwrap();

        // Floating pointer: signature + zero byte sum.
        let mut fp = [0u8; 16];
        mem.read(EBDA_START, &mut fp).unwrap();
        assert_eq!(&fp[0..4], b"_MP_");
        assert_eq!(byte_sum(&fp), 0);

        // Configuration table: signature, length, zero byte sum.
        let table_addr = EBDA_START + 16;
        let mut head = [0u8; 8];
        mem.read(table_addr, &mut head).unwrap();
        assert_eq!(&head[0..4], b"PCMP");
        let length = u16::from_le_bytes([head[4], head[5]]) as usize;
        let mut table = vec![0u8; length];
        mem.read(table_addr, &mut table).unwrap();
        assert_eq!(byte_sum(&table), 0);
    }

    #[test]
    fn test_entry_count_scales_with_cpus() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        setup_mptable(&mem, 4).unwrap();

        // entry_count at offset 34 of the config table.
        let count = mem.read_u16(EBDA_START + 16 + 34).unwrap();
        // 4 processors + bus + ioapic + 2 lintsrc.
        assert_eq!(count, 8);
    }
}

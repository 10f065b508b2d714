//! Long-mode register and page-table setup.
//!
//! The guest enters 64-bit long mode directly: a 4-entry GDT at 0x500, a
//! zeroed IDT at 0x520, and an identity map of the first 1 GiB built from
//! 2 MiB pages (one PML4 entry, one PDPTE entry, 512 PDEs). The kernel
//! replaces all of it during early init; this state only has to carry the
//! guest from the entry point to that handover.

use super::layout;
use super::memory::GuestMemory;
use super::BootError;
use crate::kvm::Vcpu;
use kvm_bindings::{kvm_fpu, kvm_regs, kvm_segment};

// Control register and EFER bits for 64-bit paged protected mode.
const CR0_PE: u64 = 0x1;
const CR0_MP: u64 = 0x2;
const CR0_ET: u64 = 0x10;
const CR0_NE: u64 = 0x20;
const CR0_WP: u64 = 0x1_0000;
const CR0_AM: u64 = 0x4_0000;
const CR0_PG: u64 = 0x8000_0000;

const CR4_PAE: u64 = 0x20;
const CR4_OSFXSR: u64 = 0x200;
const CR4_OSXMMEXCPT: u64 = 0x400;

const EFER_SCE: u64 = 0x1;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

// Page table entry flags.
const PDE64_PRESENT: u64 = 0x1;
const PDE64_RW: u64 = 0x2;
const PDE64_PS: u64 = 0x80;

const GDT_CODE: usize = 1;
const GDT_DATA: usize = 2;
const GDT_TSS: usize = 3;

/// Boot GDT: null, flat 64-bit code, flat data, TSS.
///
/// The TSS entry carries no real TSS; it only exists so TR can be loaded
/// with a valid selector.
const GDT_TABLE: [u64; 4] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0xa09b, 0, 0xfffff),
    gdt_entry(0xc093, 0, 0xfffff),
    gdt_entry(0x808b, 0, 0xfffff),
];

/// Pack flags/base/limit into the 8-byte descriptor layout.
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    let present = ((entry >> 47) & 0x1) as u8;
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        avl: ((entry >> 52) & 0x1) as u8,
        unusable: if present == 0 { 1 } else { 0 },
        ..Default::default()
    }
}

/// Identity-map the first 1 GiB with 2 MiB pages.
pub fn setup_page_tables(memory: &GuestMemory) -> Result<(), BootError> {
    memory.write_u64(layout::PML4_START, layout::PDPTE_START | PDE64_PRESENT | PDE64_RW)?;
    memory.write_u64(layout::PDPTE_START, layout::PDE_START | PDE64_PRESENT | PDE64_RW)?;

    let mut pde = [0u8; 512 * 8];
    for i in 0..512u64 {
        let entry = (i << 21) | PDE64_PRESENT | PDE64_RW | PDE64_PS;
        pde[i as usize * 8..i as usize * 8 + 8].copy_from_slice(&entry.to_le_bytes());
    }
    memory.write(layout::PDE_START, &pde)?;

    Ok(())
}

fn setup_gdt_idt(memory: &GuestMemory) -> Result<(), BootError> {
    let mut gdt = [0u8; GDT_TABLE.len() * 8];
    for (i, entry) in GDT_TABLE.iter().enumerate() {
        gdt[i * 8..i * 8 + 8].copy_from_slice(&entry.to_le_bytes());
    }
    memory.write(layout::BOOT_GDT_START, &gdt)?;
    memory.write_u64(layout::BOOT_IDT_START, 0)?;
    Ok(())
}

/// Load the special registers for long-mode entry: descriptor tables,
/// segments, paging, and EFER.
pub fn setup_sregs(vcpu: &Vcpu, memory: &GuestMemory) -> Result<(), BootError> {
    setup_gdt_idt(memory)?;

    let mut sregs = vcpu.get_sregs()?;

    sregs.gdt.base = layout::BOOT_GDT_START;
    sregs.gdt.limit = (std::mem::size_of_val(&GDT_TABLE) - 1) as u16;
    sregs.idt.base = layout::BOOT_IDT_START;
    sregs.idt.limit = (std::mem::size_of::<u64>() - 1) as u16;

    let code_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_CODE], GDT_CODE as u8);
    let data_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_DATA], GDT_DATA as u8);
    let tss_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_TSS], GDT_TSS as u8);

    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;
    sregs.tr = tss_seg;

    sregs.cr0 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;
    sregs.cr3 = layout::PML4_START;
    sregs.cr4 = CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT;
    sregs.efer = EFER_LME | EFER_LMA | EFER_SCE;

    vcpu.set_sregs(&sregs)?;
    Ok(())
}

/// Set the boot register file: entry point, boot stack, zero-page pointer.
pub fn setup_regs(vcpu: &Vcpu, entry: u64) -> Result<(), BootError> {
    let regs = kvm_regs {
        rflags: 0x2,
        rip: entry,
        rsp: layout::BOOT_STACK_POINTER,
        rsi: layout::ZERO_PAGE_START,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    Ok(())
}

/// Mask all x87/SSE exceptions, round to nearest.
pub fn setup_fpu(vcpu: &Vcpu) -> Result<(), BootError> {
    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;
    Ok(())
}

//! Virtual CPU: register plumbing and the exit loop.
//!
//! One `Vcpu` runs on one host thread. The loop enters the guest through
//! `KVM_RUN` and services whatever comes back: port I/O and MMIO go to the
//! buses, HLT ends the vCPU (and on CPU 0, the VM), debug exits are
//! logged, and a signal-interrupted entry re-enters. Anything else is
//! terminal and reported with an exit-reason code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_lapic_state, kvm_msr_entry, kvm_regs, kvm_sregs, CpuId, Msrs,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP,
};
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, error, info, warn};

use super::KvmError;
use crate::devices::Bus;

/// MSR indices initialized before boot.
mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_TSC: u32 = 0x10;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;

    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

// Local APIC registers and delivery modes.
const APIC_LVT0: usize = 0x350;
const APIC_LVT1: usize = 0x360;
const APIC_MODE_NMI: u32 = 0x4;
const APIC_MODE_EXTINT: u32 = 0x7;

fn klapic_read_reg(lapic: &kvm_lapic_state, offset: usize) -> u32 {
    let bytes: [u8; 4] = [
        lapic.regs[offset] as u8,
        lapic.regs[offset + 1] as u8,
        lapic.regs[offset + 2] as u8,
        lapic.regs[offset + 3] as u8,
    ];
    u32::from_le_bytes(bytes)
}

fn klapic_write_reg(lapic: &mut kvm_lapic_state, offset: usize, value: u32) {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        lapic.regs[offset + i] = *b as std::os::raw::c_char;
    }
}

fn set_klapic_delivery_mode(lapic: &mut kvm_lapic_state, offset: usize, mode: u32) {
    let reg = klapic_read_reg(lapic, offset);
    klapic_write_reg(lapic, offset, (reg & !0x700) | (mode << 8));
}

pub struct Vcpu {
    id: u8,
    fd: VcpuFd,
}

impl Vcpu {
    pub fn new(id: u8, fd: VcpuFd) -> Self {
        Self { id, fd }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.fd.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.fd.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.fd.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.fd.set_fpu(fpu).map_err(KvmError::SetRegisters)
    }

    pub fn set_cpuid2(&self, cpuid: &CpuId) -> Result<(), KvmError> {
        self.fd.set_cpuid2(cpuid).map_err(KvmError::SetCpuid)
    }

    /// Zero the boot-relevant MSRs, except fast-string operations which
    /// stay enabled.
    pub fn set_boot_msrs(&self) -> Result<(), KvmError> {
        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };

        let entries = [
            msr_entry(msr::IA32_SYSENTER_CS, 0),
            msr_entry(msr::IA32_SYSENTER_ESP, 0),
            msr_entry(msr::IA32_SYSENTER_EIP, 0),
            msr_entry(msr::STAR, 0),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::KERNEL_GS_BASE, 0),
            msr_entry(msr::SYSCALL_MASK, 0),
            msr_entry(msr::LSTAR, 0),
            msr_entry(msr::IA32_TSC, 0),
            msr_entry(msr::IA32_MISC_ENABLE, msr::MISC_ENABLE_FAST_STRING),
        ];

        let msrs = Msrs::from_entries(&entries).map_err(|_| KvmError::BuildMsrs)?;
        self.fd.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
        Ok(())
    }

    /// Wire LINT0 as ExtINT and LINT1 as NMI on the local APIC.
    pub fn setup_lapic(&self) -> Result<(), KvmError> {
        let mut lapic = self.fd.get_lapic().map_err(KvmError::GetLapic)?;
        set_klapic_delivery_mode(&mut lapic, APIC_LVT0, APIC_MODE_EXTINT);
        set_klapic_delivery_mode(&mut lapic, APIC_LVT1, APIC_MODE_NMI);
        self.fd.set_lapic(&lapic).map_err(KvmError::SetLapic)
    }

    fn set_single_step(&self) -> Result<(), KvmError> {
        let debug = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
            ..Default::default()
        };
        self.fd
            .set_guest_debug(&debug)
            .map_err(KvmError::SetGuestDebug)
    }

    /// Drive this vCPU until the guest halts, the VM stops, or an
    /// unhandled exit occurs. Returns the process exit code contribution:
    /// zero for a clean halt, an exit-reason code otherwise.
    pub fn run_loop(
        &mut self,
        pio: &Bus,
        mmio: &Bus,
        stop: &Arc<AtomicBool>,
        single_step: bool,
    ) -> Result<u8, KvmError> {
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(0);
            }
            if single_step {
                self.set_single_step()?;
            }

            match self.fd.run() {
                Ok(VcpuExit::IoIn(port, data)) => pio.read(u64::from(port), data),
                Ok(VcpuExit::IoOut(port, data)) => pio.write(u64::from(port), data),
                Ok(VcpuExit::MmioRead(addr, data)) => mmio.read(addr, data),
                Ok(VcpuExit::MmioWrite(addr, data)) => mmio.write(addr, data),

                Ok(VcpuExit::Hlt) => {
                    info!("vcpu {}: guest halted", self.id);
                    if self.id == 0 {
                        stop.store(true, Ordering::Release);
                    }
                    return Ok(0);
                }

                Ok(VcpuExit::Debug(arch)) => {
                    debug!(
                        "vcpu {}: debug exception {} dr6 {:#x} dr7 {:#x} pc {:#x}",
                        self.id, arch.exception, arch.dr6, arch.dr7, arch.pc
                    );
                }

                Ok(other) => {
                    let code = exit_reason_code(&other);
                    error!("vcpu {}: unhandled exit {:?}", self.id, other);
                    stop.store(true, Ordering::Release);
                    return Ok(code);
                }

                Err(e) if e.errno() == libc::EINTR => {
                    // Kicked by a signal; go around and re-check the stop
                    // flag before re-entering.
                }
                Err(e) if e.errno() == libc::EAGAIN => {
                    warn!("vcpu {}: KVM_RUN returned EAGAIN, retrying", self.id);
                }
                Err(e) => return Err(KvmError::Run(e)),
            }
        }
    }
}

/// KVM's numeric exit reason for the exits this VMM treats as terminal.
fn exit_reason_code(exit: &VcpuExit) -> u8 {
    match exit {
        VcpuExit::Shutdown => 8,
        VcpuExit::FailEntry(_, _) => 9,
        VcpuExit::InternalError => 17,
        VcpuExit::SystemEvent(_, _) => 24,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_klapic_register_roundtrip() {
        let mut lapic: kvm_lapic_state = Default::default();
        klapic_write_reg(&mut lapic, APIC_LVT0, 0x0001_8700);
        assert_eq!(klapic_read_reg(&lapic, APIC_LVT0), 0x0001_8700);
    }

    #[test]
    fn test_delivery_mode_rewrite() {
        let mut lapic: kvm_lapic_state = Default::default();
        // Existing register content with some delivery mode bits set.
        klapic_write_reg(&mut lapic, APIC_LVT0, 0x0001_0500);
        set_klapic_delivery_mode(&mut lapic, APIC_LVT0, APIC_MODE_EXTINT);
        let reg = klapic_read_reg(&lapic, APIC_LVT0);
        assert_eq!((reg >> 8) & 0x7, APIC_MODE_EXTINT);
        assert_eq!(reg & !0x700, 0x0001_0000, "other bits preserved");

        set_klapic_delivery_mode(&mut lapic, APIC_LVT1, APIC_MODE_NMI);
        assert_eq!((klapic_read_reg(&lapic, APIC_LVT1) >> 8) & 0x7, APIC_MODE_NMI);
    }
}

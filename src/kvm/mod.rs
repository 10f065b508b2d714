//! KVM plumbing: the system handle, the VM container, vCPUs, and the
//! interrupt fabric.
//!
//! Everything talks to the kernel through `kvm-ioctls`; the types here add
//! the VMM's policy on top: which capabilities are required, how guest
//! memory is sliced into slots, how GSIs are routed, and what each vCPU
//! exit means.

mod cpuid;
mod interrupt;
mod vcpu;
mod vm;

pub use cpuid::filter_cpuid;
pub use interrupt::InterruptLine;
pub use vcpu::Vcpu;
pub use vm::Vm;

use kvm_ioctls::{Cap, Kvm};
use thiserror::Error;

/// Errors from the KVM interface.
#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("host KVM is missing the {0:?} capability")]
    MissingCapability(Cap),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to enable capability: {0}")]
    EnableCap(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    #[error("failed to set GSI routing: {0}")]
    SetGsiRouting(#[source] kvm_ioctls::Error),

    #[error("failed to register irqfd: {0}")]
    RegisterIrqfd(#[source] kvm_ioctls::Error),

    #[error("failed to create interrupt eventfd: {0}")]
    EventFd(#[source] std::io::Error),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to build MSR list")]
    BuildMsrs,

    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to get local APIC state: {0}")]
    GetLapic(#[source] kvm_ioctls::Error),

    #[error("failed to set local APIC state: {0}")]
    SetLapic(#[source] kvm_ioctls::Error),

    #[error("failed to set guest debug: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    #[error("failed to install vCPU kick handler: {0}")]
    SignalHandler(#[source] nix::Error),

    #[error("failed to spawn vCPU thread: {0}")]
    SpawnThread(#[source] std::io::Error),

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] kvm_ioctls::Error),
}

/// Open `/dev/kvm` and verify the capability set this VMM depends on.
pub fn open_kvm() -> Result<Kvm, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    for cap in [
        Cap::UserMemory,
        Cap::Irqchip,
        Cap::Irqfd,
        Cap::Pit2,
        Cap::X2ApicApi,
    ] {
        if !kvm.check_extension(cap) {
            return Err(KvmError::MissingCapability(cap));
        }
    }

    Ok(kvm)
}

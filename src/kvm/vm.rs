//! The VM container.
//!
//! Owns the KVM VM file descriptor, guest memory, both device buses, the
//! interrupt lines, and the vCPUs. Construction wires up the fixed pieces
//! (TSS address, in-kernel IRQ chip and PIT, GSI routing, memory slots,
//! vCPUs with filtered CPUID); devices are then registered one by one, and
//! `run` hands each vCPU to its own thread until the guest halts.
//!
//! Cancellation: a stop flag plus SIGUSR1. The flag makes every exit
//! terminal; the signal (installed without SA_RESTART) yanks vCPUs out of
//! a blocking `KVM_RUN` so they notice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kvm_bindings::{
    kvm_enable_cap, kvm_irq_routing_entry, kvm_irq_routing_irqchip, kvm_pit_config,
    kvm_userspace_memory_region, KvmIrqRouting, KVM_CAP_X2APIC_API, KVM_IRQ_ROUTING_IRQCHIP,
    KVM_MAX_CPUID_ENTRIES, KVM_PIT_SPEAKER_DUMMY,
};
use kvm_ioctls::{Kvm, VmFd};
use log::{error, info};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use super::{filter_cpuid, InterruptLine, KvmError, Vcpu};
use crate::boot::GuestMemory;
use crate::devices::virtio::{MmioTransport, VirtioDevice};
use crate::devices::{Bus, BusDevice, DeviceError, VIRTIO_MMIO_BASE};
use crate::devices::virtio::mmio::VIRTIO_MMIO_REGION_SIZE;

const TSS_ADDRESS: u64 = 0xfffb_d000;

// In-kernel irqchip identifiers for GSI routing.
const IRQCHIP_MASTER: u32 = 0;
const IRQCHIP_SLAVE: u32 = 1;
const IRQCHIP_IOAPIC: u32 = 2;

/// Signal used to kick vCPU threads out of `KVM_RUN`.
const KICK_SIGNAL: Signal = Signal::SIGUSR1;

extern "C" fn kick_handler(_: libc::c_int) {}

fn install_kick_handler() -> Result<(), KvmError> {
    // No SA_RESTART: the whole point is that KVM_RUN returns EINTR.
    let action = SigAction::new(
        SigHandler::Handler(kick_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(KICK_SIGNAL, &action) }
        .map(|_| ())
        .map_err(KvmError::SignalHandler)
}

fn irqchip_route(gsi: u32, irqchip: u32, pin: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_IRQCHIP,
        ..Default::default()
    };
    entry.u.irqchip = kvm_irq_routing_irqchip { irqchip, pin };
    entry
}

/// Route GSIs 0-15 through both PICs and 0-23 through the IOAPIC, with
/// GSI 0 on IOAPIC pin 2 and the cascade pin skipped.
fn setup_gsi_routing(fd: &VmFd) -> Result<(), KvmError> {
    let mut entries = Vec::new();

    for i in 0..8 {
        if i != 2 {
            entries.push(irqchip_route(i, IRQCHIP_MASTER, i));
        }
    }
    for i in 8..16 {
        entries.push(irqchip_route(i, IRQCHIP_SLAVE, i - 8));
    }
    for i in 0..24 {
        if i == 0 {
            entries.push(irqchip_route(i, IRQCHIP_IOAPIC, 2));
        } else if i != 2 {
            entries.push(irqchip_route(i, IRQCHIP_IOAPIC, i));
        }
    }

    let routing = KvmIrqRouting::from_entries(&entries)
        .map_err(|_| KvmError::SetGsiRouting(kvm_ioctls::Error::new(libc::EINVAL)))?;
    fd.set_gsi_routing(&routing).map_err(KvmError::SetGsiRouting)
}

pub struct Vm {
    fd: VmFd,
    memory: Arc<GuestMemory>,

    pio: Bus,
    mmio: Bus,

    vcpus: Vec<Vcpu>,
    irqs: Vec<Arc<InterruptLine>>,

    stop: Arc<AtomicBool>,
    threads: Arc<Mutex<Vec<Pthread>>>,
}

impl Vm {
    /// Create the VM: capability setup, memory slots, in-kernel interrupt
    /// controllers, GSI routing, and `ncpus` vCPUs with filtered CPUID.
    pub fn new(kvm: &Kvm, memory: Arc<GuestMemory>, ncpus: u8) -> Result<Self, KvmError> {
        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(KvmError::GetSupportedCpuid)?;

        let fd = kvm.create_vm().map_err(KvmError::CreateVm)?;

        let x2apic = kvm_enable_cap {
            cap: KVM_CAP_X2APIC_API,
            ..Default::default()
        };
        fd.enable_cap(&x2apic).map_err(KvmError::EnableCap)?;

        fd.set_tss_address(TSS_ADDRESS as usize)
            .map_err(KvmError::SetTssAddress)?;
        fd.create_irq_chip().map_err(KvmError::CreateIrqChip)?;
        fd.create_pit2(kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        })
        .map_err(KvmError::CreatePit2)?;

        for (slot, (guest_addr, size, host_addr)) in memory.regions().into_iter().enumerate() {
            let region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: guest_addr,
                memory_size: size,
                userspace_addr: host_addr,
                flags: 0,
            };
            // The mmap behind `memory` outlives the VmFd; both live in Vm.
            unsafe {
                fd.set_user_memory_region(region)
                    .map_err(KvmError::SetMemoryRegion)?;
            }
            info!(
                "memory slot {}: {:#x} bytes at guest {:#x}",
                slot, size, guest_addr
            );
        }

        setup_gsi_routing(&fd)?;

        let mut vcpus = Vec::with_capacity(ncpus as usize);
        for id in 0..ncpus {
            let vcpu_fd = fd.create_vcpu(id.into()).map_err(KvmError::CreateVcpu)?;
            let vcpu = Vcpu::new(id, vcpu_fd);

            let mut cpuid = supported_cpuid.clone();
            filter_cpuid(&mut cpuid, id, ncpus);
            vcpu.set_cpuid2(&cpuid)?;

            vcpus.push(vcpu);
        }

        Ok(Self {
            fd,
            memory,
            pio: Bus::new("pio"),
            mmio: Bus::new("mmio"),
            vcpus,
            irqs: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Fetch or create the interrupt line for a GSI; creating binds its
    /// eventfd to the GSI through KVM's irqfd facility.
    pub fn interrupt_line(&mut self, gsi: u32) -> Result<Arc<InterruptLine>, KvmError> {
        if let Some(line) = self.irqs.iter().find(|l| l.gsi() == gsi) {
            return Ok(line.clone());
        }

        let line = Arc::new(InterruptLine::new(gsi).map_err(KvmError::EventFd)?);
        self.fd
            .register_irqfd(line.event(), gsi)
            .map_err(KvmError::RegisterIrqfd)?;
        self.irqs.push(line.clone());
        Ok(line)
    }

    /// Register a port-I/O endpoint.
    pub fn add_io_device(
        &mut self,
        base: u64,
        width: u64,
        device: Arc<Mutex<dyn BusDevice>>,
    ) -> Result<(), DeviceError> {
        self.pio.insert(base, width, device)
    }

    /// Mark a port as silently ignored.
    pub fn ignore_io_port(&mut self, port: u64) {
        self.pio.ignore(port);
    }

    /// Put a paravirtual device behind the MMIO transport in window
    /// `index`, driven by `irq`. Returns the window base address.
    pub fn add_virtio_device(
        &mut self,
        index: u64,
        irq: Arc<InterruptLine>,
        device: Box<dyn VirtioDevice>,
    ) -> Result<u64, DeviceError> {
        let base = VIRTIO_MMIO_BASE + index * VIRTIO_MMIO_REGION_SIZE;
        let transport = MmioTransport::new(device, irq);
        self.mmio
            .insert(base, VIRTIO_MMIO_REGION_SIZE, Arc::new(Mutex::new(transport)))?;
        Ok(base)
    }

    /// Run every vCPU on its own thread and wait for the VM to end.
    /// Returns the process exit code: zero for a clean halt.
    pub fn run(&mut self, single_step: bool) -> Result<u8, KvmError> {
        install_kick_handler()?;

        let pio = Arc::new(std::mem::replace(&mut self.pio, Bus::new("pio")));
        let mmio = Arc::new(std::mem::replace(&mut self.mmio, Bus::new("mmio")));

        let mut handles = Vec::new();
        for mut vcpu in std::mem::take(&mut self.vcpus) {
            let pio = pio.clone();
            let mmio = mmio.clone();
            let stop = self.stop.clone();
            let threads = self.threads.clone();

            let handle = std::thread::Builder::new()
                .name(format!("vcpu{}", vcpu.id()))
                .spawn(move || {
                    threads.lock().unwrap().push(pthread_self());
                    let result = vcpu.run_loop(&pio, &mmio, &stop, single_step);
                    // If this vCPU brought the VM down, wake the others
                    // out of KVM_RUN so they see the flag.
                    if stop.load(Ordering::Acquire) {
                        kick_all(&threads);
                    }
                    result
                })
                .map_err(KvmError::SpawnThread)?;
            handles.push(handle);
        }

        let mut code = 0u8;
        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(c)) => {
                    if code == 0 {
                        code = c;
                    }
                }
                Ok(Err(e)) => {
                    error!("vcpu thread failed: {e}");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => error!("vcpu thread panicked"),
            }
            // The first vCPU to finish means the VM is coming down.
            self.stop();
        }
        self.stop();

        match first_err {
            Some(e) => Err(e),
            None => Ok(code),
        }
    }

    /// Request every vCPU (and the device workers watching the flag) to
    /// wind down.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        kick_all(&self.threads);
    }
}

fn kick_all(threads: &Arc<Mutex<Vec<Pthread>>>) {
    for &tid in threads.lock().unwrap().iter() {
        let _ = pthread_kill(tid, KICK_SIGNAL);
    }
}

//! kthxvm - a minimal KVM virtual machine monitor.
//!
//! Boots an uncompressed 64-bit kernel image straight into long mode and
//! gives it a serial console, a PS/2 controller, an RTC, and virtio-mmio
//! block/entropy/network devices. Runs until the guest halts.
//!
//! Linux-only: the whole point is the KVM interface.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod kvm;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "kthxvm")]
#[command(about = "A minimal KVM virtual machine monitor")]
struct Args {
    /// Path to an uncompressed 64-bit kernel image
    #[arg(short, long)]
    kernel: String,

    /// Extra kernel command line, appended to the generated one
    #[arg(short, long, default_value = "")]
    cmdline: String,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// Number of vCPUs
    #[arg(long, default_value = "1")]
    cpus: u8,

    /// Raw disk image backing the virtio block device
    #[arg(short, long)]
    disk: Option<String>,

    /// Host tap interface backing the virtio network device
    #[arg(short, long)]
    tap: Option<String>,

    /// Single-step the guest and log every debug exit
    #[arg(long)]
    single_step: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    use std::fmt::Write as _;
    use std::sync::{Arc, Mutex};

    use log::info;

    use boot::GuestMemory;
    use devices::virtio::blk::VirtioBlk;
    use devices::virtio::net::VirtioNet;
    use devices::virtio::rng::VirtioRng;
    use devices::{
        Rtc, Serial, BIOS_POST_PORT, I8042, I8042_BASE, I8042_IRQ, I8042_WIDTH, RTC_BASE,
        RTC_WIDTH, SERIAL_PORTS, SERIAL_WIDTH,
    };
    use kvm::Vm;

    const BLK_IRQ: u32 = 12;
    const RNG_IRQ: u32 = 13;
    const NET_IRQ: u32 = 14;

    info!(
        "starting: kernel {}, {} MiB, {} cpu(s)",
        args.kernel, args.memory, args.cpus
    );

    let kvm_handle = kvm::open_kvm()?;
    let memory = Arc::new(GuestMemory::new(args.memory << 20)?);
    let mut vm = Vm::new(&kvm_handle, memory, args.cpus)?;

    // Legacy port-I/O devices: four UARTs (only ttyS0 talks to the host
    // terminal), the keyboard controller, the RTC; POST writes ignored.
    let mut console = None;
    for (i, (base, gsi)) in SERIAL_PORTS.iter().enumerate() {
        let irq = vm.interrupt_line(*gsi)?;
        let out: Option<Box<dyn std::io::Write + Send>> = if i == 0 {
            Some(Box::new(std::io::stdout()))
        } else {
            None
        };
        let serial = Arc::new(Mutex::new(Serial::new(irq, out)));
        if i == 0 {
            console = Some(serial.clone());
        }
        vm.add_io_device(*base, SERIAL_WIDTH, serial)?;
    }

    let kbd_irq = vm.interrupt_line(I8042_IRQ)?;
    vm.add_io_device(
        I8042_BASE,
        I8042_WIDTH,
        Arc::new(Mutex::new(I8042::new(kbd_irq))),
    )?;
    vm.add_io_device(RTC_BASE, RTC_WIDTH, Arc::new(Mutex::new(Rtc::new())))?;
    vm.ignore_io_port(BIOS_POST_PORT);

    // Paravirtual devices, each in its own MMIO window with its own GSI;
    // the kernel discovers them through the command line.
    let mut cmdline = String::from("console=ttyS0");
    let mut mmio_index = 0u64;

    if let Some(disk) = &args.disk {
        let irq = vm.interrupt_line(BLK_IRQ)?;
        let blk = VirtioBlk::new(disk, vm.memory().clone(), irq.clone())?;
        let base = vm.add_virtio_device(mmio_index, irq, Box::new(blk))?;
        write!(cmdline, " virtio_mmio.device=0x1000@{base:#x}:{BLK_IRQ}")?;
        mmio_index += 1;
    }

    {
        let irq = vm.interrupt_line(RNG_IRQ)?;
        let rng = VirtioRng::new(vm.memory().clone(), irq.clone())?;
        let base = vm.add_virtio_device(mmio_index, irq, Box::new(rng))?;
        write!(cmdline, " virtio_mmio.device=0x1000@{base:#x}:{RNG_IRQ}")?;
        mmio_index += 1;
    }

    if let Some(tap) = &args.tap {
        let irq = vm.interrupt_line(NET_IRQ)?;
        let net = VirtioNet::new(tap, vm.memory().clone(), irq.clone(), vm.stop_flag())?;
        let base = vm.add_virtio_device(mmio_index, irq, Box::new(net))?;
        write!(cmdline, " virtio_mmio.device=0x1000@{base:#x}:{NET_IRQ}")?;
    }

    if args.disk.is_some() {
        cmdline.push_str(" root=/dev/vda init=/sbin/init");
    }
    if !args.cmdline.is_empty() {
        cmdline.push(' ');
        cmdline.push_str(&args.cmdline);
    }

    // Boot preparation: image, zero page, MP table, long-mode CPU state.
    let entry = boot::load_kernel(vm.memory(), &args.kernel)?;
    boot::setup_boot_params(vm.memory(), &cmdline)?;
    boot::setup_mptable(vm.memory(), args.cpus)?;
    boot::setup_page_tables(vm.memory())?;
    for vcpu in vm.vcpus() {
        vcpu.set_boot_msrs()?;
        vcpu.setup_lapic()?;
        boot::setup_sregs(vcpu, vm.memory())?;
        boot::setup_fpu(vcpu)?;
        boot::setup_regs(vcpu, entry)?;
    }

    // Host terminal input feeds the console UART's RX FIFO.
    let reader = console.map(|console| {
        let stop = vm.stop_flag();
        std::thread::spawn(move || read_terminal(console, stop))
    });

    let code = vm.run(args.single_step)?;
    info!("guest finished with code {code}");

    if let Some(reader) = reader {
        reader.join().ok();
    }

    Ok(code)
}

/// Poll stdin and push whatever arrives into the console UART.
#[cfg(target_os = "linux")]
fn read_terminal(
    console: std::sync::Arc<std::sync::Mutex<devices::Serial>>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;
    use std::sync::atomic::Ordering;

    let stdin_fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
    let mut buf = [0u8; 64];

    while !stop.load(Ordering::Acquire) {
        let mut fds = [PollFd::new(stdin_fd, PollFlags::POLLIN)];
        let readable = match poll(&mut fds, PollTimeout::from(100u16)) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map_or(false, |r| r.contains(PollFlags::POLLIN)),
            _ => false,
        };
        if !readable {
            continue;
        }

        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
        console.lock().unwrap().queue_input(&buf[..n as usize]);
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<u8, Box<dyn std::error::Error>> {
    Err("kthxvm requires Linux with KVM support".into())
}

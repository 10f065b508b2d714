//! virtio-net backend over a host tap device.
//!
//! Three queues: rx (0), tx (1), ctrl (2). The tap is opened with
//! IFF_VNET_HDR and a 12-byte virtio header plus checksum/TSO/UFO
//! offloads, so frames move between the tap and the rings verbatim,
//! header included.
//!
//! rx and tx each run on their own worker thread. Queue notifies arrive
//! on the vCPU thread and are converted into channel wakeups; the workers
//! also watch the VM stop flag and shut down cooperatively. The ctrl
//! queue is acknowledged inline and not interpreted further.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::queue::Virtqueue;
use super::{VirtioDevice, VIRTIO_ID_NET};
use crate::boot::GuestMemory;
use crate::kvm::InterruptLine;

const RX_QUEUE: u32 = 0;
const TX_QUEUE: u32 = 1;
const CTRL_QUEUE: u32 = 2;

// Feature bits (virtio-net).
const VIRTIO_NET_F_CSUM: u64 = 1 << 0;
const VIRTIO_NET_F_MAC: u64 = 1 << 5;
const VIRTIO_NET_F_GUEST_TSO4: u64 = 1 << 7;
const VIRTIO_NET_F_GUEST_TSO6: u64 = 1 << 8;
const VIRTIO_NET_F_GUEST_UFO: u64 = 1 << 10;
const VIRTIO_NET_F_HOST_TSO4: u64 = 1 << 11;
const VIRTIO_NET_F_HOST_TSO6: u64 = 1 << 12;
const VIRTIO_NET_F_HOST_UFO: u64 = 1 << 14;
const VIRTIO_NET_F_CTRL_VQ: u64 = 1 << 17;

/// Locally administered MAC handed to the guest.
const MAC_ADDR: [u8; 6] = [0x02, 0x15, 0x15, 0x15, 0x15, 0x15];

/// virtio-net header length with VERSION_1 (num_buffers included).
const VNET_HDR_LEN: i32 = 12;

/// A full frame plus the virtio header.
const MAX_FRAME: usize = 65536 + VNET_HDR_LEN as usize;

// Tun device ioctls and offload flags, from linux/if_tun.h.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETOFFLOAD: libc::c_ulong = 0x4004_54d0;
const TUNSETVNETHDRSZ: libc::c_ulong = 0x4004_54d8;

const TUN_F_CSUM: libc::c_uint = 0x01;
const TUN_F_TSO4: libc::c_uint = 0x02;
const TUN_F_TSO6: libc::c_uint = 0x04;
const TUN_F_UFO: libc::c_uint = 0x10;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

struct Tap {
    file: File,
}

impl Tap {
    fn open(name: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, &src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR;

        let fd = file.as_raw_fd();
        if unsafe { libc::ioctl(fd, TUNSETIFF, &ifr) } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let hdr_len: libc::c_int = VNET_HDR_LEN;
        if unsafe { libc::ioctl(fd, TUNSETVNETHDRSZ, &hdr_len) } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let offload = TUN_F_CSUM | TUN_F_TSO4 | TUN_F_TSO6 | TUN_F_UFO;
        if unsafe { libc::ioctl(fd, TUNSETOFFLOAD, offload) } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(Self { file })
    }

    /// Wait for a readable frame; false on timeout.
    fn readable(&self, timeout_ms: u16) -> bool {
        let fd = self.file.as_fd();
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map_or(false, |r| r.contains(PollFlags::POLLIN)),
            Ok(_) => false,
            Err(e) => {
                error!("virtio-net: tap poll: {e}");
                false
            }
        }
    }
}

/// Copy a frame into a descriptor chain until one of them runs out.
/// Returns the number of bytes written to guest memory.
fn scatter_frame(mem: &GuestMemory, queue: &Virtqueue, head: u16, frame: &[u8]) -> u32 {
    let mut remaining = frame;
    let mut written = 0u32;
    let mut desc = queue.desc(head);

    while let Some(d) = desc {
        if remaining.is_empty() {
            break;
        }
        let take = remaining.len().min(d.len as usize);
        if let Err(e) = mem.write(d.addr, &remaining[..take]) {
            error!("virtio-net: rx buffer write: {e}");
            break;
        }
        written += take as u32;
        remaining = &remaining[take..];
        desc = queue.chain_next(&d);
    }

    written
}

/// Gather a device-readable chain into `buf`. Returns the packet length.
fn gather_chain(mem: &GuestMemory, queue: &Virtqueue, head: u16, buf: &mut Vec<u8>) -> usize {
    buf.clear();
    let mut desc = queue.desc(head);

    while let Some(d) = desc {
        if !d.is_write_only() {
            let start = buf.len();
            buf.resize(start + d.len as usize, 0);
            if let Err(e) = mem.read(d.addr, &mut buf[start..]) {
                error!("virtio-net: tx buffer read: {e}");
                buf.truncate(start);
                break;
            }
        }
        desc = queue.chain_next(&d);
    }

    buf.len()
}

fn raise_irq(irq: &InterruptLine, queue: &Virtqueue, used_idx: u16) {
    if queue.needs_interrupt(used_idx) {
        if let Err(e) = irq.set_level(true) {
            error!("virtio-net: irq: {e}");
        }
    }
}

struct RxWorker {
    tap: Arc<Tap>,
    queue: Arc<Virtqueue>,
    mem: Arc<GuestMemory>,
    irq: Arc<InterruptLine>,
    stop: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl RxWorker {
    fn done(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }

    fn run(self) {
        let mut frame = vec![0u8; MAX_FRAME];
        while !self.done() {
            // A buffer chain first, then a frame for it.
            let Some(head) = self.queue.next() else {
                let _ = self.wake.recv_timeout(Duration::from_millis(100));
                continue;
            };

            while !self.done() && !self.tap.readable(100) {}
            if self.done() {
                break;
            }

            let len = match (&self.tap.file).read(&mut frame) {
                Ok(len) => len,
                Err(e) => {
                    error!("virtio-net: tap read: {e}");
                    continue;
                }
            };

            let written = scatter_frame(&self.mem, &self.queue, head, &frame[..len]);
            let used_idx = self.queue.add_used(head, written);
            raise_irq(&self.irq, &self.queue, used_idx);
        }
    }
}

struct TxWorker {
    tap: Arc<Tap>,
    queue: Arc<Virtqueue>,
    mem: Arc<GuestMemory>,
    irq: Arc<InterruptLine>,
    stop: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl TxWorker {
    fn done(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }

    fn run(self) {
        let mut packet = Vec::with_capacity(MAX_FRAME);
        while !self.done() {
            let _ = self.wake.recv_timeout(Duration::from_millis(100));

            while let Some(head) = self.queue.next() {
                let len = gather_chain(&self.mem, &self.queue, head, &mut packet);
                if len > 0 {
                    if let Err(e) = (&self.tap.file).write_all(&packet[..len]) {
                        error!("virtio-net: tap write: {e}");
                    }
                }
                let used_idx = self.queue.add_used(head, 0);
                raise_irq(&self.irq, &self.queue, used_idx);
            }
        }
    }
}

pub struct VirtioNet {
    queues: Vec<Arc<Virtqueue>>,
    irq: Arc<InterruptLine>,

    config: [u8; 12],
    generation: u32,

    rx_wake: Sender<()>,
    tx_wake: Sender<()>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl VirtioNet {
    /// Open the tap and start the rx/tx workers. The tap interface must
    /// already exist and be configured on the host.
    pub fn new(
        tap_name: &str,
        mem: Arc<GuestMemory>,
        irq: Arc<InterruptLine>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let tap = Arc::new(Tap::open(tap_name)?);
        info!("virtio-net: attached to tap {tap_name}");

        let queues: Vec<Arc<Virtqueue>> = (0..3)
            .map(|_| Arc::new(Virtqueue::new(mem.clone())))
            .collect();

        let (rx_wake, rx_recv) = channel();
        let (tx_wake, tx_recv) = channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let rx = RxWorker {
            tap: tap.clone(),
            queue: queues[RX_QUEUE as usize].clone(),
            mem: mem.clone(),
            irq: irq.clone(),
            stop: stop.clone(),
            shutdown: shutdown.clone(),
            wake: rx_recv,
        };
        let tx = TxWorker {
            tap,
            queue: queues[TX_QUEUE as usize].clone(),
            mem: mem.clone(),
            irq: irq.clone(),
            stop,
            shutdown: shutdown.clone(),
            wake: tx_recv,
        };

        let workers = vec![
            std::thread::Builder::new()
                .name("virtio-net-rx".into())
                .spawn(move || rx.run())?,
            std::thread::Builder::new()
                .name("virtio-net-tx".into())
                .spawn(move || tx.run())?,
        ];

        let mut config = [0u8; 12];
        config[0..6].copy_from_slice(&MAC_ADDR);

        Ok(Self {
            queues,
            irq,
            config,
            generation: 0,
            rx_wake,
            tx_wake,
            shutdown,
            workers,
        })
    }

    fn ack_ctrl(&self) {
        let queue = &self.queues[CTRL_QUEUE as usize];
        while let Some(head) = queue.next() {
            let used_idx = queue.add_used(head, 0);
            raise_irq(&self.irq, queue, used_idx);
        }
    }
}

impl Drop for VirtioNet {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.rx_wake.send(());
        let _ = self.tx_wake.send(());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl VirtioDevice for VirtioNet {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn device_features(&self) -> u64 {
        VIRTIO_NET_F_CSUM
            | VIRTIO_NET_F_MAC
            | VIRTIO_NET_F_GUEST_TSO4
            | VIRTIO_NET_F_GUEST_TSO6
            | VIRTIO_NET_F_GUEST_UFO
            | VIRTIO_NET_F_HOST_TSO4
            | VIRTIO_NET_F_HOST_TSO6
            | VIRTIO_NET_F_HOST_UFO
            | VIRTIO_NET_F_CTRL_VQ
    }

    fn queues(&self) -> &[Arc<Virtqueue>] {
        &self.queues
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let offset = offset as usize;
        if offset + data.len() > self.config.len() {
            warn!("virtio-net: config read past the end at {offset:#x}");
            data.fill(0);
            return;
        }
        data.copy_from_slice(&self.config[offset..offset + data.len()]);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        if offset + data.len() > self.config.len() {
            warn!("virtio-net: config write past the end at {offset:#x}");
            return;
        }
        self.config[offset..offset + data.len()].copy_from_slice(data);
        self.generation += 1;
    }

    fn config_generation(&self) -> u32 {
        self.generation
    }

    fn notify(&mut self, queue_index: u32) {
        match queue_index {
            RX_QUEUE => {
                let _ = self.rx_wake.send(());
            }
            TX_QUEUE => {
                let _ = self.tx_wake.send(());
            }
            CTRL_QUEUE => self.ack_ctrl(),
            other => warn!("virtio-net: notify for unknown queue {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

    const DESC_ADDR: u64 = 0x1000;
    const AVAIL_ADDR: u64 = 0x2000;
    const USED_ADDR: u64 = 0x3000;

    fn ring(mem: &Arc<GuestMemory>) -> Virtqueue {
        let q = Virtqueue::new(mem.clone());
        q.set_size(8);
        q.set_desc_low(DESC_ADDR as u32);
        q.set_avail_low(AVAIL_ADDR as u32);
        q.set_used_low(USED_ADDR as u32);
        q.set_ready(true);
        q
    }

    fn write_desc(mem: &GuestMemory, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC_ADDR + u64::from(index) * 16;
        mem.write_u64(base, addr).unwrap();
        mem.write_u32(base + 8, len).unwrap();
        mem.write_u16(base + 12, flags).unwrap();
        mem.write_u16(base + 14, next).unwrap();
    }

    #[test]
    fn test_scatter_across_chain() {
        let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
        let q = ring(&mem);
        write_desc(&mem, 0, 0x8000, 4, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 1);
        write_desc(&mem, 1, 0x9000, 16, VIRTQ_DESC_F_WRITE, 0);

        let frame = b"0123456789";
        let written = scatter_frame(&mem, &q, 0, frame);
        assert_eq!(written, 10);

        let mut first = [0u8; 4];
        mem.read(0x8000, &mut first).unwrap();
        assert_eq!(&first, b"0123");
        let mut second = [0u8; 6];
        mem.read(0x9000, &mut second).unwrap();
        assert_eq!(&second, b"456789");
    }

    #[test]
    fn test_scatter_truncates_when_chain_ends() {
        let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
        let q = ring(&mem);
        write_desc(&mem, 0, 0x8000, 4, VIRTQ_DESC_F_WRITE, 0);

        let written = scatter_frame(&mem, &q, 0, b"0123456789");
        assert_eq!(written, 4, "chain ran out before the frame did");
    }

    #[test]
    fn test_gather_skips_writable_descriptors() {
        let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
        let q = ring(&mem);
        mem.write(0x8000, b"head").unwrap();
        mem.write(0x9000, b"tail").unwrap();
        write_desc(&mem, 0, 0x8000, 4, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&mem, 1, 0xa000, 64, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 2);
        write_desc(&mem, 2, 0x9000, 4, 0, 0);

        let mut buf = Vec::new();
        let len = gather_chain(&mem, &q, 0, &mut buf);
        assert_eq!(len, 8);
        assert_eq!(&buf, b"headtail");
    }
}

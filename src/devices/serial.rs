//! 16550-compatible UART.
//!
//! Eight registers behind one port-I/O window. TX bytes go through a small
//! FIFO and are flushed to the attached writer (the host terminal for
//! ttyS0, nothing for the other ports); RX bytes are pushed in by the
//! terminal reader thread. With MCR loopback set, written data lands
//! straight in the RX FIFO instead.
//!
//! The interrupt line is re-evaluated after every register access from the
//! IER/LSR state: receive-data-ready and transmitter-idle are the two
//! sources this model raises.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use log::error;

use super::bus::BusDevice;
use crate::kvm::InterruptLine;

/// Register offsets within the 8-byte window.
mod regs {
    pub const DATA: u64 = 0;
    pub const IER: u64 = 1;
    pub const IIR: u64 = 2; // FCR on write
    pub const LCR: u64 = 3;
    pub const MCR: u64 = 4;
    pub const LSR: u64 = 5;
    pub const MSR: u64 = 6;
    pub const SCR: u64 = 7;
}

const IER_RECV_BIT: u8 = 0x1;
const IER_THR_BIT: u8 = 0x2;
const IER_MASK: u8 = 0x0f;

const IIR_NONE_BIT: u8 = 0x1;
const IIR_THR_BIT: u8 = 0x2;
const IIR_RECV_BIT: u8 = 0x4;
const IIR_FIFO_BITS: u8 = 0xc0;

const LCR_DLAB_BIT: u8 = 0x80;

const LSR_DATA_BIT: u8 = 0x1;
const LSR_BREAK_BIT: u8 = 0x10;
const LSR_EMPTY_BIT: u8 = 0x20;
const LSR_IDLE_BIT: u8 = 0x40;

const MCR_LOOP_BIT: u8 = 0x10;

const FIFO_LEN: usize = 64;

/// One UART instance. Shared between the exit loop and (for the console
/// port) the terminal reader, so it lives behind an `Arc<Mutex<_>>` on the
/// bus.
pub struct Serial {
    irq: Arc<InterruptLine>,
    out: Option<Box<dyn Write + Send>>,

    baud_divisor: u16,
    ier: u8,
    iir: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scr: u8,

    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl Serial {
    pub fn new(irq: Arc<InterruptLine>, out: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            irq,
            out,
            baud_divisor: 0,
            ier: 0,
            iir: IIR_NONE_BIT,
            fcr: 0,
            lcr: 0,
            mcr: 0x08,
            lsr: LSR_EMPTY_BIT | LSR_IDLE_BIT,
            msr: 0x20 | 0x10 | 0x80,
            scr: 0,
            rx: VecDeque::with_capacity(FIFO_LEN),
            tx: Vec::with_capacity(FIFO_LEN),
        }
    }

    fn is_dlab_set(&self) -> bool {
        self.lcr & LCR_DLAB_BIT != 0
    }

    fn is_loop(&self) -> bool {
        self.mcr & MCR_LOOP_BIT != 0
    }

    /// Feed host input into the RX FIFO. Called by the terminal reader.
    pub fn queue_input(&mut self, data: &[u8]) {
        if self.is_loop() {
            return;
        }
        for &byte in data {
            if self.rx.len() >= FIFO_LEN {
                break;
            }
            self.rx.push_back(byte);
            self.lsr |= LSR_DATA_BIT;
        }
        self.update_irq();
    }

    fn read_reg(&mut self, offset: u64) -> u8 {
        if self.is_dlab_set() {
            match offset {
                regs::DATA => return self.baud_divisor as u8,
                regs::IER => return (self.baud_divisor >> 8) as u8,
                _ => {}
            }
        }

        let value = match offset {
            regs::DATA => {
                if self.lsr & LSR_BREAK_BIT != 0 {
                    self.lsr &= !LSR_BREAK_BIT;
                    0
                } else {
                    let byte = self.rx.pop_front().unwrap_or(0);
                    if self.rx.is_empty() {
                        self.lsr &= !LSR_DATA_BIT;
                    }
                    byte
                }
            }
            regs::IER => self.ier,
            regs::IIR => self.iir | IIR_FIFO_BITS,
            regs::LCR => self.lcr,
            regs::MCR => self.mcr,
            regs::LSR => self.lsr,
            regs::MSR => self.msr,
            regs::SCR => self.scr,
            _ => 0,
        };

        self.update_irq();
        value
    }

    fn write_reg(&mut self, offset: u64, value: u8) {
        if self.is_dlab_set() {
            match offset {
                regs::DATA => {
                    self.baud_divisor = (self.baud_divisor & 0xff00) | u16::from(value);
                    return;
                }
                regs::IER => {
                    self.baud_divisor = (self.baud_divisor & 0x00ff) | (u16::from(value) << 8);
                    return;
                }
                _ => {}
            }
        }

        match offset {
            regs::DATA => {
                if self.is_loop() {
                    if self.rx.len() < FIFO_LEN {
                        self.rx.push_back(value);
                        self.lsr |= LSR_DATA_BIT;
                    }
                } else if self.tx.len() < FIFO_LEN {
                    self.tx.push(value);
                    self.lsr &= !LSR_IDLE_BIT;
                    if self.tx.len() == FIFO_LEN / 2 {
                        self.lsr &= !LSR_EMPTY_BIT;
                    }
                    self.flush_tx();
                } else {
                    self.lsr &= !(LSR_EMPTY_BIT | LSR_IDLE_BIT);
                }
            }
            regs::IER => self.ier = value & IER_MASK,
            regs::IIR => self.fcr = value,
            regs::LCR => self.lcr = value,
            regs::MCR => self.mcr = value,
            regs::LSR | regs::MSR => { /* read-only */ }
            regs::SCR => self.scr = value,
            _ => {}
        }

        self.update_irq();
    }

    fn flush_tx(&mut self) {
        self.lsr |= LSR_EMPTY_BIT | LSR_IDLE_BIT;
        if !self.tx.is_empty() {
            if let Some(out) = self.out.as_mut() {
                if let Err(e) = out.write_all(&self.tx).and_then(|_| out.flush()) {
                    error!("serial output write failed: {e}");
                }
            }
            self.tx.clear();
        }
    }

    fn update_irq(&mut self) {
        let mut iir = 0;

        if self.ier & IER_RECV_BIT != 0 && self.lsr & LSR_DATA_BIT != 0 {
            iir |= IIR_RECV_BIT;
        }
        if self.ier & IER_THR_BIT != 0 && self.lsr & LSR_IDLE_BIT != 0 {
            iir |= IIR_THR_BIT;
        }

        let level = iir != 0;
        self.iir = if level { iir } else { IIR_NONE_BIT };
        if let Err(e) = self.irq.set_level(level) {
            error!("serial irq line: {e}");
        }
    }
}

impl BusDevice for Serial {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte = self.read_reg(offset);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        for &byte in data {
            self.write_reg(offset, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn serial() -> (Serial, SharedBuf, Arc<InterruptLine>) {
        let irq = Arc::new(InterruptLine::new(4).unwrap());
        let buf = SharedBuf::default();
        let s = Serial::new(irq.clone(), Some(Box::new(buf.clone())));
        (s, buf, irq)
    }

    #[test]
    fn test_tx_reaches_output() {
        let (mut s, buf, _) = serial();
        for &b in b"hi" {
            s.write_reg(regs::DATA, b);
        }
        assert_eq!(&*buf.0.lock().unwrap(), b"hi");
        assert_eq!(
            s.read_reg(regs::LSR) & (LSR_EMPTY_BIT | LSR_IDLE_BIT),
            LSR_EMPTY_BIT | LSR_IDLE_BIT
        );
    }

    #[test]
    fn test_loopback_echo() {
        let (mut s, buf, _) = serial();
        s.write_reg(regs::MCR, MCR_LOOP_BIT);
        for &b in &[0x41u8, 0x42, 0x43] {
            s.write_reg(regs::DATA, b);
        }
        assert_eq!(s.read_reg(regs::LSR) & LSR_DATA_BIT, LSR_DATA_BIT);
        assert_eq!(s.read_reg(regs::DATA), 0x41);
        assert_eq!(s.read_reg(regs::DATA), 0x42);
        assert_eq!(s.read_reg(regs::DATA), 0x43);
        assert_eq!(s.read_reg(regs::LSR) & LSR_DATA_BIT, 0);
        // Nothing leaked to the host side.
        assert!(buf.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dlab_divisor() {
        let (mut s, _, _) = serial();
        s.write_reg(regs::LCR, LCR_DLAB_BIT);
        s.write_reg(regs::DATA, 0x18);
        s.write_reg(regs::IER, 0x01);
        assert_eq!(s.read_reg(regs::DATA), 0x18);
        assert_eq!(s.read_reg(regs::IER), 0x01);
        s.write_reg(regs::LCR, 0);
        assert_eq!(s.read_reg(regs::IER), 0);
    }

    #[test]
    fn test_rx_interrupt() {
        let (mut s, _, irq) = serial();
        s.write_reg(regs::IER, IER_RECV_BIT);
        // Enabling only the receive interrupt leaves the line low.
        assert!(!irq.level());

        s.queue_input(b"x");
        assert!(irq.level());
        assert_eq!(s.read_reg(regs::IIR) & IIR_RECV_BIT, IIR_RECV_BIT);

        assert_eq!(s.read_reg(regs::DATA), b'x');
        assert!(!irq.level());
    }

    #[test]
    fn test_thr_interrupt() {
        let (mut s, _, irq) = serial();
        s.write_reg(regs::IER, IER_THR_BIT);
        // Transmitter is idle, so the THR interrupt is pending.
        assert!(irq.level());
        assert_eq!(s.read_reg(regs::IIR) & IIR_THR_BIT, IIR_THR_BIT);
    }

    #[test]
    fn test_queue_input_respects_fifo_len() {
        let (mut s, _, _) = serial();
        s.queue_input(&[0xaa; FIFO_LEN + 16]);
        let mut count = 0;
        while s.read_reg(regs::LSR) & LSR_DATA_BIT != 0 {
            s.read_reg(regs::DATA);
            count += 1;
        }
        assert_eq!(count, FIFO_LEN);
    }

    #[test]
    fn test_scratch_register() {
        let (mut s, _, _) = serial();
        s.write_reg(regs::SCR, 0x42);
        assert_eq!(s.read_reg(regs::SCR), 0x42);
    }
}

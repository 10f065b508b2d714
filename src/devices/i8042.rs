//! i8042 keyboard controller.
//!
//! Enough of the PS/2 controller for a kernel to probe it and move on: a
//! 16-byte output FIFO behind the data port, a status byte, the command
//! byte protocol for reading/writing the control and output ports, and an
//! ACK for anything sent directly to the keyboard. The keyboard interrupt
//! is edge-pulsed when enabled in the control byte.
//!
//! The bus window covers ports 0x60..0x64, so the data register is offset
//! 0 and the command/status register offset 4.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{info, warn};

use super::bus::BusDevice;
use crate::kvm::InterruptLine;

pub const I8042_BASE: u64 = 0x60;
pub const I8042_WIDTH: u64 = 5;

const DATA_REG: u64 = 0x0;
const COMMAND_REG: u64 = 0x4;

const CMD_READ_CTR: u8 = 0x20;
const CMD_WRITE_CTR: u8 = 0x60;
const CMD_READ_OUTP: u8 = 0xd0;
const CMD_WRITE_OUTP: u8 = 0xd1;
const CMD_RESET_CPU: u8 = 0xfe;
const CMD_RESET_KBD: u8 = 0xff;

// Status byte.
const SB_OUT_DATA_AVAIL: u8 = 0x01;
const SB_I8042_CMD_DATA: u8 = 0x08;
const SB_KBD_ENABLED: u8 = 0x10;

// Control byte.
const CB_KBD_INT: u8 = 0x01;
const CB_POST_OK: u8 = 0x04;

const BUF_SIZE: usize = 16;

const KBD_ACK: u8 = 0xfa;

pub struct I8042 {
    irq: Arc<InterruptLine>,

    command: u8,
    status: u8,
    control: u8,
    outp: u8,

    buffer: VecDeque<u8>,
}

impl I8042 {
    pub fn new(irq: Arc<InterruptLine>) -> Self {
        Self {
            irq,
            command: 0,
            status: SB_KBD_ENABLED,
            control: CB_POST_OK | CB_KBD_INT,
            outp: 0,
            buffer: VecDeque::with_capacity(BUF_SIZE),
        }
    }

    fn trigger_irq(&self) {
        if self.control & CB_KBD_INT != 0 {
            if let Err(e) = self.irq.pulse() {
                warn!("i8042 irq line: {e}");
            }
        }
    }

    fn pop(&mut self) -> u8 {
        let value = self.buffer.pop_front().unwrap_or(0);
        if self.buffer.is_empty() {
            self.status &= !SB_OUT_DATA_AVAIL;
        }
        value
    }

    fn push(&mut self, value: u8) {
        if self.buffer.len() == BUF_SIZE {
            return;
        }
        self.status |= SB_OUT_DATA_AVAIL;
        self.buffer.push_back(value);
    }

    fn flush(&mut self) {
        self.buffer.clear();
        self.status &= !SB_OUT_DATA_AVAIL;
    }

    fn write_command(&mut self, cmd: u8) {
        match cmd {
            CMD_READ_CTR => {
                self.flush();
                let control = self.control;
                self.push(control);
            }
            CMD_WRITE_CTR => {
                self.flush();
                self.status |= SB_I8042_CMD_DATA;
                self.command = cmd;
            }
            CMD_READ_OUTP => {
                self.flush();
                let outp = self.outp;
                self.push(outp);
            }
            CMD_WRITE_OUTP => {
                self.status |= SB_I8042_CMD_DATA;
                self.command = cmd;
            }
            CMD_RESET_CPU => {
                info!("i8042: guest requested cpu reset");
            }
            CMD_RESET_KBD => {
                self.status = 0;
            }
            _ => {
                warn!("i8042: unhandled command {cmd:#x}");
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        if self.status & SB_I8042_CMD_DATA != 0 {
            match self.command {
                CMD_WRITE_CTR => self.control = value,
                CMD_WRITE_OUTP => self.outp = value,
                _ => {}
            }
            self.status &= !SB_I8042_CMD_DATA;
        } else {
            // Anything written straight to the keyboard gets an ACK.
            self.flush();
            self.push(KBD_ACK);
            self.trigger_irq();
        }
    }
}

impl BusDevice for I8042 {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        match offset {
            COMMAND_REG => data[0] = self.status,
            DATA_REG => {
                data[0] = self.pop();
                if self.status & SB_OUT_DATA_AVAIL != 0 {
                    self.trigger_irq();
                }
            }
            _ => {}
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        match offset {
            COMMAND_REG => self.write_command(data[0]),
            DATA_REG => self.write_data(data[0]),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i8042() -> (I8042, Arc<InterruptLine>) {
        let irq = Arc::new(InterruptLine::new(1).unwrap());
        (I8042::new(irq.clone()), irq)
    }

    #[test]
    fn test_direct_write_acks() {
        let (mut kbd, irq) = i8042();
        let mut data = [0u8; 1];

        kbd.write(DATA_REG, &[0xf4]);
        kbd.read(COMMAND_REG, &mut data);
        assert_eq!(data[0] & SB_OUT_DATA_AVAIL, SB_OUT_DATA_AVAIL);

        kbd.read(DATA_REG, &mut data);
        assert_eq!(data[0], KBD_ACK);

        kbd.read(COMMAND_REG, &mut data);
        assert_eq!(data[0] & SB_OUT_DATA_AVAIL, 0);

        // The enabled keyboard interrupt pulsed once.
        assert_eq!(irq.event().read().unwrap(), 1);
    }

    #[test]
    fn test_read_control_register()  {
        let (mut kbd, _) = i8042();
        let mut data = [0u8; 1];
        kbd.write(COMMAND_REG, &[CMD_READ_CTR]);
        kbd.read(DATA_REG, &mut data);
        assert_eq!(data[0], CB_POST_OK | CB_KBD_INT);
    }

    #[test]
    fn test_write_control_register() {
        let (mut kbd, _) = i8042();
        let mut data = [0u8; 1];

        kbd.write(COMMAND_REG, &[CMD_WRITE_CTR]);
        kbd.read(COMMAND_REG, &mut data);
        assert_eq!(data[0] & SB_I8042_CMD_DATA, SB_I8042_CMD_DATA);

        // Parameter byte lands in the control register, not the FIFO.
        kbd.write(DATA_REG, &[CB_POST_OK]);
        kbd.read(COMMAND_REG, &mut data);
        assert_eq!(data[0] & SB_I8042_CMD_DATA, 0);

        kbd.write(COMMAND_REG, &[CMD_READ_CTR]);
        kbd.read(DATA_REG, &mut data);
        assert_eq!(data[0], CB_POST_OK);
    }

    #[test]
    fn test_output_port_roundtrip() {
        let (mut kbd, _) = i8042();
        let mut data = [0u8; 1];

        kbd.write(COMMAND_REG, &[CMD_WRITE_OUTP]);
        kbd.write(DATA_REG, &[0x5a]);
        kbd.write(COMMAND_REG, &[CMD_READ_OUTP]);
        kbd.read(DATA_REG, &mut data);
        assert_eq!(data[0], 0x5a);
    }

    #[test]
    fn test_reset_kbd_clears_status() {
        let (mut kbd, _) = i8042();
        let mut data = [0u8; 1];
        kbd.write(COMMAND_REG, &[CMD_RESET_KBD]);
        kbd.read(COMMAND_REG, &mut data);
        assert_eq!(data[0], 0);
    }
}

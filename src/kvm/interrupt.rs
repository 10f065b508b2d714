//! Level-triggered interrupt lines.
//!
//! Each line pairs a GSI with an eventfd. The eventfd is registered with
//! KVM's irqfd facility at VM setup, so a token written here is delivered
//! to the guest as a level-triggered interrupt on the next vCPU entry.
//!
//! Only the rising edge produces a token: repeated `set_level(true)` calls
//! are idempotent, and lowering the line never touches the eventfd. KVM
//! deasserts the in-kernel line when the guest acknowledges the interrupt.

use std::io;
use std::sync::Mutex;

use vmm_sys_util::eventfd::EventFd;

/// A single level-triggered IRQ line bound to a global system interrupt.
pub struct InterruptLine {
    gsi: u32,
    event: EventFd,
    level: Mutex<bool>,
}

impl InterruptLine {
    pub fn new(gsi: u32) -> io::Result<Self> {
        Ok(Self {
            gsi,
            event: EventFd::new(0)?,
            level: Mutex::new(false),
        })
    }

    pub fn gsi(&self) -> u32 {
        self.gsi
    }

    /// The event descriptor KVM polls for this line.
    pub fn event(&self) -> &EventFd {
        &self.event
    }

    /// Drive the line. Exactly one wakeup token is written per low-to-high
    /// transition; all other transitions leave the eventfd untouched.
    pub fn set_level(&self, level: bool) -> io::Result<()> {
        let mut state = self.level.lock().unwrap();
        if *state != level && level {
            self.event.write(1)?;
        }
        *state = level;
        Ok(())
    }

    pub fn level(&self) -> bool {
        *self.level.lock().unwrap()
    }

    /// Assert and immediately deassert, for edge-style sources.
    pub fn pulse(&self) -> io::Result<()> {
        self.set_level(true)?;
        self.set_level(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rising_edge_writes_one_token() {
        let line = InterruptLine::new(5).unwrap();
        line.set_level(true).unwrap();
        assert!(line.level());
        assert_eq!(line.event().read().unwrap(), 1);
    }

    #[test]
    fn test_latch_counts_transitions() {
        let line = InterruptLine::new(5).unwrap();
        line.set_level(false).unwrap();
        line.set_level(true).unwrap();
        line.set_level(true).unwrap();
        line.set_level(false).unwrap();
        line.set_level(true).unwrap();
        // Two low-to-high transitions, two tokens.
        assert_eq!(line.event().read().unwrap(), 2);
    }

    #[test]
    fn test_lowering_writes_nothing() {
        let line = InterruptLine::new(9).unwrap();
        line.set_level(true).unwrap();
        line.set_level(false).unwrap();
        assert!(!line.level());
        assert_eq!(line.event().read().unwrap(), 1);
    }

    #[test]
    fn test_pulse() {
        let line = InterruptLine::new(1).unwrap();
        line.pulse().unwrap();
        line.pulse().unwrap();
        assert!(!line.level());
        assert_eq!(line.event().read().unwrap(), 2);
    }
}

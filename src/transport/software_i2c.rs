//! Bit-banged I2C master.
//!
//! Adapters that can only toggle and sense two open-drain lines (modem control
//! lines of a USB-serial chip, parallel port pins) implement [`LineDriver`];
//! [`SoftwareI2c`] turns that into byte transactions with ACK handling.

use std::thread::sleep;
use std::time::Duration;

use crate::constants::timing;
use crate::error::{Error, Result};
use crate::poll::Poll;

/// Nominal bus frequency.
pub const I2C_FREQ: u64 = 100_000;
/// Settle time after every line transition: (1e6 / I2C_FREQ) / 2 microseconds.
pub const HALF_PERIOD: Duration = Duration::from_micros(1_000_000 / I2C_FREQ / 2);

const READ: u8 = 1;
const WRITE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    Sda,
    Scl,
}

/// Line level primitives of an open-drain bus.
pub trait LineDriver {
    /// Actively pull `line` low.
    fn drive_low(&mut self, line: Line) -> Result<()>;

    /// Stop driving `line` and return its level, `true` for high.
    ///
    /// Adapters that cannot sense SCL report it as high.
    fn release(&mut self, line: Line) -> Result<bool>;
}

pub struct SoftwareI2c<L> {
    lines: L,
    half_period: Duration,
    stretch: Poll,
}

impl<L: LineDriver> SoftwareI2c<L> {
    pub fn new(lines: L) -> Self {
        SoftwareI2c {
            lines,
            half_period: HALF_PERIOD,
            stretch: Poll::new(
                timing::CLOCK_STRETCH_TIMEOUT,
                timing::CLOCK_STRETCH_INTERVAL,
            ),
        }
    }

    pub fn with_half_period(mut self, half_period: Duration) -> Self {
        self.half_period = half_period;
        self
    }

    pub fn with_stretch_timeout(mut self, timeout: Duration) -> Self {
        self.stretch.timeout = timeout;
        self
    }

    pub fn lines(&self) -> &L {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut L {
        &mut self.lines
    }

    fn settle(&self) {
        if !self.half_period.is_zero() {
            sleep(self.half_period);
        }
    }

    fn pull(&mut self, line: Line) -> Result<()> {
        self.lines.drive_low(line)?;
        self.settle();
        Ok(())
    }

    fn release(&mut self, line: Line) -> Result<bool> {
        let level = self.lines.release(line)?;
        self.settle();
        Ok(level)
    }

    /// Release SCL and wait while a slave stretches the clock.
    fn release_wait(&mut self) -> Result<()> {
        let poll = self.stretch;
        poll.wait_stuck("SCL", || self.lines.release(Line::Scl))?;
        self.settle();
        Ok(())
    }

    fn clock_out(&mut self) -> Result<bool> {
        for _ in 0..9 {
            self.pull(Line::Scl)?;
            self.release(Line::Scl)?;
        }
        self.lines.release(Line::Sda)
    }

    /// Clock the bus until a slave stuck mid-byte lets go of SDA, then stop.
    pub fn reset(&mut self) -> Result<()> {
        self.release(Line::Sda)?;
        let poll = self.stretch;
        poll.wait_stuck("SDA", || self.clock_out())?;
        self.pull(Line::Scl)?;
        self.pull(Line::Sda)?;
        self.stop_condition(false)
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.release(Line::Sda)? {
            log::debug!("SDA held low before START, resetting bus");
            self.reset()?;
        }
        self.release_wait()?;
        self.pull(Line::Sda)?;
        self.pull(Line::Scl)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.stop_condition(true)
    }

    fn stop_condition(&mut self, recover: bool) -> Result<()> {
        self.release_wait()?;
        if self.release(Line::Sda)? {
            return Ok(());
        }
        if recover {
            log::debug!("SDA held low after STOP, resetting bus");
            self.reset()
        } else {
            Err(Error::BusStuck {
                what: "SDA",
                timeout_ms: self.stretch.timeout.as_millis(),
            })
        }
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<()> {
        if bit {
            self.release(Line::Sda)?;
        } else {
            self.pull(Line::Sda)?;
        }
        self.release_wait()?;
        self.pull(Line::Scl)?;
        self.pull(Line::Sda)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        self.release(Line::Sda)?;
        self.release_wait()?;
        let bit = self.lines.release(Line::Sda)?;
        self.pull(Line::Scl)?;
        self.pull(Line::Sda)?;
        Ok(bit)
    }

    /// Send a byte MSB first, return `true` if the slave acknowledged it.
    pub fn write_byte(&mut self, byte: u8) -> Result<bool> {
        for i in (0..8).rev() {
            self.write_bit(byte >> i & 1 != 0)?;
        }
        Ok(!self.read_bit()?)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte << 1) | self.read_bit()? as u8;
        }
        Ok(byte)
    }

    fn address(&mut self, address: u8, direction: u8) -> Result<()> {
        self.start()?;
        if !self.write_byte(address << 1 | direction)? {
            self.stop()?;
            return Err(Error::NoAck { address });
        }
        Ok(())
    }

    pub fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        self.address(address, WRITE)?;
        for &byte in data {
            if !self.write_byte(byte)? {
                self.stop()?;
                return Err(Error::NoAck { address });
            }
        }
        self.stop()
    }

    /// Read `count` bytes, acknowledging all but the last one.
    pub fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        self.address(address, READ)?;
        let mut data = Vec::with_capacity(count);
        for i in 0..count {
            data.push(self.read_byte()?);
            self.write_bit(i + 1 == count)?;
        }
        self.stop()?;
        Ok(data)
    }
}

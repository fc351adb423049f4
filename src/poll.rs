//! Bounded wait used by every polling site: clock stretching, busy bits,
//! CRC completion and custom instruction completion.

use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Poll {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Poll { timeout, interval }
    }

    /// Call `ready` until it returns `true`. The condition is always checked at
    /// least once, and once more after the deadline passes.
    ///
    /// Errors from `ready` abort the wait unchanged; expiry is turned into the
    /// error built by `on_timeout`.
    pub fn wait<F, E>(&self, mut ready: F, on_timeout: E) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
        E: FnOnce() -> Error,
    {
        let start = Instant::now();
        loop {
            if ready()? {
                return Ok(());
            }
            if start.elapsed() >= self.timeout {
                return Err(on_timeout());
            }
            if !self.interval.is_zero() {
                sleep(self.interval);
            }
        }
    }

    /// Shorthand for waits whose expiry means a line or status bit is stuck.
    pub fn wait_stuck<F>(&self, what: &'static str, ready: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        let timeout_ms = self.timeout.as_millis();
        self.wait(ready, || Error::BusStuck { what, timeout_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_immediately() {
        let poll = Poll::new(Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        poll.wait_stuck("line", || {
            calls += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn expiry_reports_bus_stuck() {
        let poll = Poll::new(Duration::from_millis(5), Duration::from_millis(1));
        let err = poll.wait_stuck("SCL", || Ok(false)).unwrap_err();
        assert!(matches!(err, Error::BusStuck { what: "SCL", .. }));
    }

    #[test]
    fn custom_timeout_error() {
        let poll = Poll::new(Duration::ZERO, Duration::ZERO);
        let err = poll
            .wait(|| Ok(false), || Error::CustomInstructionTimeout { opcode: 0x60 })
            .unwrap_err();
        assert!(matches!(err, Error::CustomInstructionTimeout { opcode: 0x60 }));
    }

    #[test]
    fn condition_errors_propagate() {
        let poll = Poll::new(Duration::from_secs(1), Duration::ZERO);
        let err = poll
            .wait_stuck("busy", || Err(Error::NoAck { address: 0x4a }))
            .unwrap_err();
        assert!(matches!(err, Error::NoAck { address: 0x4a }));
    }
}

//! Error types shared by the transports, the ISP session and the flash logic.

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum Error {
    /// The device did not acknowledge its address or a data byte.
    #[error("no ACK from device 0x{address:02x}")]
    NoAck { address: u8 },

    /// A line or a status bit never reached the expected level.
    #[error("{what} stuck (timed out after {timeout_ms} ms)")]
    BusStuck { what: &'static str, timeout_ms: u128 },

    /// The ISP enable bit did not read back as set.
    #[error("failed to enter ISP mode")]
    EnterIspFailed,

    #[error("custom instruction 0x{opcode:02x} timed out")]
    CustomInstructionTimeout { opcode: u8 },

    /// Host and device CRC disagree. The transfer itself completed.
    #[error("CRC mismatch: host 0x{host:02x}, device 0x{device:02x}")]
    VerificationFailed { host: u8, device: u8 },

    #[error("operation requires session state {expected:?}, current state is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("interface is not initialized")]
    NotInitialized,

    #[error("image of {size} bytes does not fit the {capacity} byte flash")]
    ImageTooLarge { size: usize, capacity: u32 },

    #[error("cannot read {size} bytes, the address space ends at {limit}")]
    ReadTooLarge { size: u32, limit: u32 },

    #[error("invalid interface settings: {0}")]
    InvalidSettings(String),

    #[error("interface device {0} not found")]
    DeviceNotFound(u32),

    #[error("unknown interface \"{0}\"")]
    UnknownTransport(String),

    #[error("interface \"{name}\" is not supported on {os}/{arch}")]
    UnsupportedPlatform {
        name: &'static str,
        os: &'static str,
        arch: &'static str,
    },

    /// Backend specific failure reported by the adapter.
    #[error("{0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Usb(#[from] rusb::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Library(#[from] libloading::Error),

    #[error(transparent)]
    Encoding(#[from] scroll::Error),
}

impl Error {
    /// Errors that mean "nothing answered at this address" rather than a broken setup.
    pub fn is_absent_device(&self) -> bool {
        matches!(
            self,
            Error::NoAck { .. } | Error::BusStuck { .. } | Error::Io(_) | Error::Transport(_)
        )
    }

    /// CRC mismatch after a completed transfer; the whole operation may be retried.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Error::VerificationFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! RTD2660/RTD2662 ISP programming over I2C.

pub mod constants;
pub mod crc;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod gff;
pub mod poll;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::device::{ChipDB, FlashChip};
pub use self::error::{Error, Result};
pub use self::flashing::Flashing;
pub use self::protocol::{CustomInstruction, InstructionKind};
pub use self::session::{Session, SessionState};
pub use self::transport::I2cTransport;

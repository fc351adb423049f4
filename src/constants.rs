//! Protocol constants of the RTD2660/RTD2662 ISP interface.
use std::time::Duration;

/// Controller address on the I2C bus.
pub const ISP_ADDRESS: u8 = 0x4A;
/// Same controller, but the register pointer advances after every byte.
pub const ISP_AUTOINC_ADDRESS: u8 = ISP_ADDRESS | 1;

/// Flash is programmed one page at a time.
pub const PAGE_SIZE: usize = 128;

/// Flash addresses are 24 bits wide on the wire.
pub const MAX_FLASH_SIZE: u32 = 1 << 24;

/// Used by `read` when neither the flash table nor the user gives a size.
pub const DEFAULT_READ_SIZE: u32 = 512 * 1024;

/// Controller register map.
pub mod registers {
    /// Custom instruction control: kind, lengths, start bit.
    pub const CONTROL: u8 = 0x60;
    /// Custom instruction opcode.
    pub const OPCODE: u8 = 0x61;
    pub const WREN_OPCODE: u8 = 0x62;
    pub const EWSR_OPCODE: u8 = 0x63;
    /// First of three write operand / address registers (big-endian).
    pub const WRITE_OPERAND: u8 = 0x64;
    /// First of three read result registers (big-endian).
    pub const READ_RESULT: u8 = 0x67;
    pub const READ_OPCODE: u8 = 0x6A;
    pub const PROGRAM_OPCODE: u8 = 0x6D;
    pub const RDSR_OPCODE: u8 = 0x6E;
    /// ISP enable, programming and CRC control/status.
    pub const ISP_STATUS: u8 = 0x6F;
    /// Programming buffer / read stream data port.
    pub const DATA_PORT: u8 = 0x70;
    /// Number of buffered bytes minus one.
    pub const PROGRAM_SIZE: u8 = 0x71;
    /// First of three CRC end address registers (big-endian).
    pub const CRC_END: u8 = 0x72;
    pub const CRC_RESULT: u8 = 0x75;
    /// Writing `REBOOT` here restarts the internal MCU.
    pub const MCU_CONTROL: u8 = 0xEE;

    pub const REBOOT: u8 = 0x02;
}

/// SPI flash opcodes issued through custom instructions.
pub mod opcodes {
    pub const WREN: u8 = 0x06;
    pub const RDSR: u8 = 0x05;
    pub const EWSR: u8 = 0x50;
    pub const WRSR: u8 = 0x01;
    pub const READ: u8 = 0x03;
    pub const PROGRAM: u8 = 0x02;
    pub const CHIP_ERASE: u8 = 0x60;
    pub const RDID: u8 = 0x9F;
}

/// Status register values written around destructive operations.
pub mod status {
    pub const UNPROTECTED: u32 = 0x00;
    pub const PROTECTED: u32 = 0x1C;
}

/// Poll timeouts.
pub mod timing {
    use super::Duration;

    pub const POLL_INTERVAL: Duration = Duration::from_millis(1);
    pub const INSTRUCTION_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ERASE_TIMEOUT: Duration = Duration::from_secs(20);
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CRC_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CLOCK_STRETCH_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CLOCK_STRETCH_INTERVAL: Duration = Duration::from_micros(10);
}

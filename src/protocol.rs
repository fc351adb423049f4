//! Register level encoding of the RTD ISP protocol.

use std::fmt;

use bitfield::bitfield;
use scroll::{Pread, Pwrite, BE};

use crate::constants::opcodes;
use crate::error::{Error, Result};

bitfield! {
    /// Custom instruction control register (0x60).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ControlRegister(u8);
    impl Debug;
    pub u8, kind, set_kind: 7, 5;
    pub u8, write_len, set_write_len: 4, 3;
    pub u8, read_len, set_read_len: 2, 1;
    /// Set by the host to run the instruction, cleared by the controller when done.
    pub start, set_start: 0;
}

impl ControlRegister {
    pub fn from_raw(raw: u8) -> Self {
        ControlRegister(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

bitfield! {
    /// ISP enable / programming / CRC register (0x6F).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IspStatus(u8);
    impl Debug;
    pub isp_enabled, set_isp_enabled: 7;
    /// A page program is still in progress.
    pub busy, set_busy: 6;
    pub program_start, set_program_start: 5;
    pub crc_start, set_crc_start: 2;
    pub crc_done, set_crc_done: 1;
}

impl IspStatus {
    pub fn from_raw(raw: u8) -> Self {
        IspStatus(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn enter_isp() -> Self {
        let mut status = IspStatus(0);
        status.set_isp_enabled(true);
        status
    }

    pub fn start_program() -> Self {
        let mut status = Self::enter_isp();
        status.set_program_start(true);
        status
    }

    pub fn start_crc() -> Self {
        let mut status = Self::enter_isp();
        status.set_crc_start(true);
        status
    }
}

/// How the controller wraps the opcode on the SPI bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionKind {
    Nop = 0,
    Write = 1,
    Read = 2,
    WriteAfterWren = 3,
    WriteAfterEwsr = 4,
    Erase = 5,
}

impl TryFrom<u8> for InstructionKind {
    type Error = u8;

    fn try_from(raw: u8) -> std::result::Result<Self, u8> {
        Ok(match raw {
            0 => InstructionKind::Nop,
            1 => InstructionKind::Write,
            2 => InstructionKind::Read,
            3 => InstructionKind::WriteAfterWren,
            4 => InstructionKind::WriteAfterEwsr,
            5 => InstructionKind::Erase,
            other => return Err(other),
        })
    }
}

/// SPI flash instruction executed by the controller on behalf of the host.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CustomInstruction {
    pub kind: InstructionKind,
    pub opcode: u8,
    /// Result bytes to fetch from 0x67.., 0 to 3.
    pub read_len: u8,
    /// Operand bytes placed in 0x64.., 0 to 3.
    pub write_len: u8,
    pub value: u32,
}

impl CustomInstruction {
    pub fn new(kind: InstructionKind, opcode: u8, read_len: u8, write_len: u8, value: u32) -> Self {
        debug_assert!(read_len <= 3 && write_len <= 3);
        CustomInstruction {
            kind,
            opcode,
            read_len,
            write_len,
            value,
        }
    }

    pub fn read_id() -> Self {
        Self::new(InstructionKind::Read, opcodes::RDID, 3, 0, 0)
    }

    /// Prime the read stream at `address`.
    pub fn read_stream(address: u32) -> Self {
        Self::new(InstructionKind::Read, opcodes::READ, 3, 3, address)
    }

    pub fn write_status(kind: InstructionKind, value: u32) -> Self {
        Self::new(kind, opcodes::WRSR, 0, 1, value)
    }

    pub fn chip_erase() -> Self {
        Self::new(InstructionKind::Erase, opcodes::CHIP_ERASE, 0, 0, 0)
    }

    pub fn control(&self) -> ControlRegister {
        let mut reg = ControlRegister(0);
        reg.set_kind(self.kind as u8);
        reg.set_write_len(self.write_len);
        reg.set_read_len(self.read_len);
        reg.set_start(true);
        reg
    }

    /// Operand bytes, big-endian, `write_len` long.
    pub fn operand(&self) -> Result<Vec<u8>> {
        be_bytes(self.value, self.write_len as usize)
    }

    pub fn is_erase(&self) -> bool {
        self.kind == InstructionKind::Erase || self.opcode == opcodes::CHIP_ERASE
    }
}

impl fmt::Debug for CustomInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(0x{:02x}, r{}, w{}",
            self.kind, self.opcode, self.read_len, self.write_len
        )?;
        if self.write_len > 0 {
            write!(f, " 0x{:x}", self.value)?;
        }
        write!(f, ")")
    }
}

/// Low `len` bytes of `value`, big-endian. Fails if `value` needs more.
pub fn be_bytes(value: u32, len: usize) -> Result<Vec<u8>> {
    let needed = 4 - value.leading_zeros() as usize / 8;
    if len > 4 || needed > len {
        return Err(Error::Encoding(scroll::Error::TooBig {
            size: needed.max(len),
            len: len.min(4),
        }));
    }
    let mut buf = [0u8; 4];
    buf.pwrite_with(value, 0, BE)?;
    Ok(buf[4 - len..].to_vec())
}

/// Inverse of `be_bytes` for up to four bytes.
pub fn from_be_bytes(raw: &[u8]) -> Result<u32> {
    let mut buf = [0u8; 4];
    let len = raw.len().min(4);
    buf[4 - len..].copy_from_slice(&raw[raw.len() - len..]);
    Ok(buf.pread_with::<u32>(0, BE)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_layout() {
        let wrsr = CustomInstruction::write_status(InstructionKind::WriteAfterWren, 0x1C);
        assert_eq!(wrsr.control().raw(), (3 << 5) | (1 << 3) | 1);

        let read = CustomInstruction::read_stream(0);
        assert_eq!(read.control().raw(), (2 << 5) | (3 << 3) | (3 << 1) | 1);

        let erase = CustomInstruction::chip_erase();
        assert_eq!(erase.control().raw(), 0xA1);
    }

    #[test]
    fn control_register_decodes() {
        let reg = ControlRegister::from_raw(0x5B);
        assert_eq!(reg.kind(), 2);
        assert_eq!(reg.write_len(), 3);
        assert_eq!(reg.read_len(), 1);
        assert!(reg.start());
    }

    #[test]
    fn status_values() {
        assert_eq!(IspStatus::enter_isp().raw(), 0x80);
        assert_eq!(IspStatus::start_program().raw(), 0xA0);
        assert_eq!(IspStatus::start_crc().raw(), 0x84);
        assert!(IspStatus::from_raw(0x42).busy());
        assert!(IspStatus::from_raw(0x82).crc_done());
    }

    #[test]
    fn only_chip_erase_is_an_erase() {
        assert!(CustomInstruction::chip_erase().is_erase());
        assert!(!CustomInstruction::read_id().is_erase());
        assert!(!CustomInstruction::write_status(InstructionKind::WriteAfterWren, 0).is_erase());
    }

    #[test]
    fn big_endian_operands() {
        assert_eq!(be_bytes(0x012345, 3).unwrap(), vec![0x01, 0x23, 0x45]);
        assert_eq!(be_bytes(0x1C, 1).unwrap(), vec![0x1C]);
        assert!(be_bytes(0, 0).unwrap().is_empty());
        // 24-bit flash addresses
        assert_eq!(be_bytes(0xFF_FFFF, 3).unwrap(), vec![0xFF; 3]);
        assert!(be_bytes(0x100_0000, 3).is_err());
        assert!(be_bytes(0x100, 1).is_err());
        assert_eq!(from_be_bytes(&[0xEF, 0x30, 0x13]).unwrap(), 0xEF3013);
    }

    #[test]
    fn kind_round_trip() {
        assert_eq!(InstructionKind::try_from(5), Ok(InstructionKind::Erase));
        assert_eq!(InstructionKind::try_from(7), Err(7));
    }
}

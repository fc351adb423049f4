//! ISP session: register access, custom instructions and the device CRC unit.
use std::fmt;
use std::time::Duration;

use crate::constants::{ISP_ADDRESS, ISP_AUTOINC_ADDRESS, registers, timing};
use crate::error::{Error, Result};
use crate::poll::Poll;
use crate::protocol::{ControlRegister, CustomInstruction, IspStatus, be_bytes, from_be_bytes};
use crate::transport::I2cTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport not initialized.
    Closed,
    /// Transport open, controller running its firmware.
    Initialized,
    /// Controller halted in ISP mode, flash accessible.
    IspActive,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How long to poll the controller's completion and status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub instruction: Duration,
    /// Chip erase takes far longer than any other instruction.
    pub erase: Duration,
    pub busy: Duration,
    pub crc: Duration,
    pub interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            instruction: timing::INSTRUCTION_TIMEOUT,
            erase: timing::ERASE_TIMEOUT,
            busy: timing::BUSY_TIMEOUT,
            crc: timing::CRC_TIMEOUT,
            interval: timing::POLL_INTERVAL,
        }
    }
}

impl Timeouts {
    fn instruction(&self, instruction: &CustomInstruction) -> Poll {
        let timeout = if instruction.is_erase() {
            self.erase
        } else {
            self.instruction
        };
        Poll::new(timeout, self.interval)
    }
}

/// Owns a transport for the duration of one programming session.
///
/// Lifecycle: `init -> enter_isp -> (execute | program | read)* -> exit_isp -> deinit`.
pub struct Session<T: I2cTransport> {
    transport: T,
    state: SessionState,
    timeouts: Timeouts,
}

impl<T: I2cTransport> Session<T> {
    pub fn new(transport: T) -> Self {
        Session {
            transport,
            state: SessionState::Closed,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn require(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        self.require(SessionState::Closed)?;
        self.transport.init(device, settings)?;
        if let Err(e) = self.write_chunk() {
            self.transport.deinit()?;
            return Err(e);
        }
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Halt the controller MCU and hand flash access to the ISP engine.
    pub fn enter_isp(&mut self) -> Result<()> {
        if self.state == SessionState::IspActive {
            return Ok(());
        }
        self.require(SessionState::Initialized)?;

        if let Err(e) = self.write_reg(registers::ISP_STATUS, &[IspStatus::enter_isp().raw()]) {
            if !e.is_absent_device() {
                return Err(e);
            }
            log::debug!("ISP enable write failed: {}", e);
        }
        let status = match self.read_reg(registers::ISP_STATUS) {
            Ok(raw) => IspStatus::from_raw(raw),
            Err(e) if e.is_absent_device() => {
                log::debug!("ISP status read failed: {}", e);
                return Err(Error::EnterIspFailed);
            }
            Err(e) => return Err(e),
        };
        if !status.isp_enabled() {
            log::debug!("ISP status reads 0x{:02x}", status.raw());
            return Err(Error::EnterIspFailed);
        }
        log::debug!("Entered ISP mode");
        self.state = SessionState::IspActive;
        Ok(())
    }

    /// Reboot the controller MCU. Errors are ignored, the controller
    /// usually stops acknowledging halfway through the restart.
    pub fn exit_isp(&mut self) {
        if self.state != SessionState::IspActive {
            return;
        }
        if let Err(e) = self.write_reg(registers::MCU_CONTROL, &[registers::REBOOT]) {
            log::debug!("reboot write not acknowledged: {}", e);
        }
        self.state = SessionState::Initialized;
    }

    pub fn deinit(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.transport.deinit()
    }

    /// Payload bytes per write transaction, `None` for unlimited.
    ///
    /// Every frame starts with the register byte, so a transport must carry
    /// at least two bytes per write.
    fn write_chunk(&self) -> Result<Option<usize>> {
        match self.transport.max_write() {
            0 => Ok(None),
            1 => Err(Error::InvalidSettings(
                "a write limit of 1 byte leaves no room for register data".into(),
            )),
            n => Ok(Some(n - 1)),
        }
    }

    fn read_chunk(&self) -> Option<usize> {
        match self.transport.max_read() {
            0 => None,
            n => Some(n),
        }
    }

    fn write_on(&mut self, address: u8, reg: u8, payload: &[u8]) -> Result<()> {
        log::trace!("write 0x{:02x} [{:02x}] {}", address, reg, hex::encode(payload));
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(reg);
        frame.extend_from_slice(payload);
        self.transport.write(address, &frame)
    }

    fn read_on(&mut self, address: u8, reg: u8, count: usize) -> Result<Vec<u8>> {
        self.transport.write(ISP_ADDRESS, &[reg])?;
        let data = self.transport.read(address, count)?;
        log::trace!("read 0x{:02x} [{:02x}] {}", address, reg, hex::encode(&data));
        Ok(data)
    }

    /// Write `payload` to a single register. Long payloads are split into
    /// several transactions to the same register (the data port FIFO).
    pub fn write_reg(&mut self, reg: u8, payload: &[u8]) -> Result<()> {
        match self.write_chunk()? {
            Some(chunk) if payload.len() > chunk => {
                for part in payload.chunks(chunk) {
                    self.write_on(ISP_ADDRESS, reg, part)?;
                }
                Ok(())
            }
            _ => self.write_on(ISP_ADDRESS, reg, payload),
        }
    }

    /// Write `payload` to consecutive registers starting at `reg`.
    pub fn write_regs(&mut self, reg: u8, payload: &[u8]) -> Result<()> {
        if payload.len() <= 1 {
            return self.write_reg(reg, payload);
        }
        let chunk = self.write_chunk()?.unwrap_or(payload.len());
        for (i, part) in payload.chunks(chunk).enumerate() {
            let start = reg.wrapping_add((i * chunk) as u8);
            self.write_on(ISP_AUTOINC_ADDRESS, start, part)?;
        }
        Ok(())
    }

    pub fn read_reg(&mut self, reg: u8) -> Result<u8> {
        let data = self.read_on(ISP_ADDRESS, reg, 1)?;
        data.first()
            .copied()
            .ok_or_else(|| Error::Transport("empty register read".into()))
    }

    /// Read `count` consecutive registers starting at `reg`.
    pub fn read_regs(&mut self, reg: u8, count: usize) -> Result<Vec<u8>> {
        if count == 1 {
            return Ok(vec![self.read_reg(reg)?]);
        }
        let chunk = self.read_chunk().unwrap_or(count.max(1));
        let mut data = Vec::with_capacity(count);
        while data.len() < count {
            let n = chunk.min(count - data.len());
            let start = reg.wrapping_add(data.len() as u8);
            let part = self.read_on(ISP_AUTOINC_ADDRESS, start, n)?;
            if part.is_empty() {
                return Err(Error::Transport("empty register read".into()));
            }
            data.extend(part);
        }
        Ok(data)
    }

    /// Read `count` bytes from one register without advancing the pointer.
    pub fn read_fifo(&mut self, reg: u8, count: usize) -> Result<Vec<u8>> {
        let chunk = self.read_chunk().unwrap_or(count.max(1));
        let mut data = Vec::with_capacity(count);
        while data.len() < count {
            let n = chunk.min(count - data.len());
            let part = self.read_on(ISP_ADDRESS, reg, n)?;
            if part.is_empty() {
                return Err(Error::Transport("empty data port read".into()));
            }
            data.extend(part);
        }
        Ok(data)
    }

    /// Run `instruction` on the SPI flash and return its big-endian result.
    pub fn execute(&mut self, instruction: &CustomInstruction) -> Result<u32> {
        self.require(SessionState::IspActive)?;
        log::trace!("execute {:?}", instruction);
        if instruction.write_len > 0 {
            let operand = instruction.operand()?;
            self.write_regs(registers::WRITE_OPERAND, &operand)?;
        }
        self.write_reg(registers::OPCODE, &[instruction.opcode])?;
        self.write_reg(registers::CONTROL, &[instruction.control().raw()])?;

        self.timeouts.instruction(instruction).wait(
            || Ok(!ControlRegister::from_raw(self.read_reg(registers::CONTROL)?).start()),
            || Error::CustomInstructionTimeout {
                opcode: instruction.opcode,
            },
        )?;

        if instruction.read_len == 0 {
            return Ok(0);
        }
        let raw = self.read_regs(registers::READ_RESULT, instruction.read_len as usize)?;
        from_be_bytes(&raw)
    }

    /// Wait for the page programmer to go idle.
    pub fn wait_not_busy(&mut self) -> Result<()> {
        Poll::new(self.timeouts.busy, self.timeouts.interval).wait_stuck("flash busy", || {
            Ok(!IspStatus::from_raw(self.read_reg(registers::ISP_STATUS)?).busy())
        })
    }

    /// CRC-8 the controller computes over flash `[start, end]`, inclusive.
    pub fn device_crc(&mut self, start: u32, end: u32) -> Result<u8> {
        self.require(SessionState::IspActive)?;
        self.write_regs(registers::WRITE_OPERAND, &be_bytes(start, 3)?)?;
        self.write_regs(registers::CRC_END, &be_bytes(end, 3)?)?;
        self.write_reg(registers::ISP_STATUS, &[IspStatus::start_crc().raw()])?;
        Poll::new(self.timeouts.crc, self.timeouts.interval).wait_stuck("CRC done", || {
            Ok(IspStatus::from_raw(self.read_reg(registers::ISP_STATUS)?).crc_done())
        })?;
        self.read_reg(registers::CRC_RESULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::opcodes;
    use crate::crc::crc8;
    use crate::protocol::InstructionKind;
    use crate::transport::Emulator;

    fn active(emulator: Emulator) -> Session<Emulator> {
        let mut session = Session::new(emulator);
        session.init(0, None).unwrap();
        session.enter_isp().unwrap();
        session
    }

    #[test]
    fn lifecycle() {
        let mut session = Session::new(Emulator::default());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.enter_isp(),
            Err(Error::InvalidState {
                expected: SessionState::Initialized,
                actual: SessionState::Closed
            })
        ));
        session.init(0, None).unwrap();
        session.enter_isp().unwrap();
        assert!(session.transport().isp_enabled());
        session.exit_isp();
        assert_eq!(session.state(), SessionState::Initialized);
        assert!(!session.transport().isp_enabled());
        session.deinit().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn enter_isp_fails_without_ack() {
        let mut session = Session::new(Emulator::default().nack_writes());
        session.init(0, None).unwrap();
        assert!(matches!(session.enter_isp(), Err(Error::EnterIspFailed)));
        assert_eq!(session.state(), SessionState::Initialized);

        let mut session = Session::new(Emulator::default().absent());
        session.init(0, None).unwrap();
        assert!(matches!(session.enter_isp(), Err(Error::EnterIspFailed)));
    }

    #[test]
    fn execute_requires_isp() {
        let mut session = Session::new(Emulator::default());
        session.init(0, None).unwrap();
        assert!(session.execute(&CustomInstruction::read_id()).is_err());
    }

    #[test]
    fn read_id_through_result_registers() {
        let mut session = active(Emulator::default().with_jedec_id(0xC84013));
        assert_eq!(session.execute(&CustomInstruction::read_id()).unwrap(), 0xC84013);
    }

    #[test]
    fn status_register_read_back() {
        let mut session = active(Emulator::default());
        let rdsr = CustomInstruction::new(InstructionKind::Read, opcodes::RDSR, 1, 0, 0);
        assert_eq!(session.execute(&rdsr).unwrap(), 0x1C);
    }

    #[test]
    fn register_runs_respect_write_limit() {
        let mut session = active(Emulator::default().with_limits(2, 2));
        session.write_regs(registers::WRITE_OPERAND, &[0x12, 0x34, 0x56]).unwrap();
        assert_eq!(session.transport().register(0x64), 0x12);
        assert_eq!(session.transport().register(0x65), 0x34);
        assert_eq!(session.transport().register(0x66), 0x56);
        assert_eq!(
            session.read_regs(registers::WRITE_OPERAND, 3).unwrap(),
            vec![0x12, 0x34, 0x56]
        );
    }

    #[test]
    fn device_crc_matches_host() {
        let contents: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let mut session = active(Emulator::default().with_contents(contents.clone()));
        assert_eq!(session.device_crc(0, 4095).unwrap(), crc8(&contents));
        assert_eq!(session.device_crc(16, 31).unwrap(), crc8(&contents[16..32]));
    }

    #[test]
    fn idle_programmer_is_not_busy() {
        let mut session = active(Emulator::default().with_busy_polls(3));
        session.wait_not_busy().unwrap();
    }

    #[test]
    fn single_byte_write_limit_is_rejected() {
        let mut session = Session::new(Emulator::default().with_limits(0, 1));
        assert!(matches!(
            session.init(0, None),
            Err(Error::InvalidSettings(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    fn quick() -> Timeouts {
        let limit = Duration::from_millis(5);
        Timeouts {
            instruction: limit,
            erase: limit,
            busy: limit,
            crc: limit,
            interval: Duration::ZERO,
        }
    }

    fn active_quick(emulator: Emulator) -> Session<Emulator> {
        let mut session = Session::new(emulator).with_timeouts(quick());
        session.init(0, None).unwrap();
        session.enter_isp().unwrap();
        session
    }

    #[test]
    fn stalled_instruction_times_out() {
        let mut session = active_quick(Emulator::default().stall_instructions());
        assert!(matches!(
            session.execute(&CustomInstruction::read_id()),
            Err(Error::CustomInstructionTimeout { opcode: opcodes::RDID })
        ));
        assert!(matches!(
            session.execute(&CustomInstruction::chip_erase()),
            Err(Error::CustomInstructionTimeout { opcode: opcodes::CHIP_ERASE })
        ));
    }

    #[test]
    fn stalled_crc_unit_is_stuck() {
        let mut session = active_quick(Emulator::default().stall_crc());
        assert!(matches!(
            session.device_crc(0, 127),
            Err(Error::BusStuck { what: "CRC done", .. })
        ));
    }

    #[test]
    fn endless_page_program_is_stuck() {
        let mut session = active_quick(Emulator::default().with_busy_polls(u32::MAX));
        let unprotect = CustomInstruction::write_status(InstructionKind::WriteAfterWren, 0);
        session.execute(&unprotect).unwrap();
        session.write_reg(registers::PROGRAM_SIZE, &[0]).unwrap();
        session.write_regs(registers::WRITE_OPERAND, &[0, 0, 0]).unwrap();
        session.write_reg(registers::DATA_PORT, &[0x00]).unwrap();
        session
            .write_reg(registers::ISP_STATUS, &[IspStatus::start_program().raw()])
            .unwrap();
        assert!(matches!(
            session.wait_not_busy(),
            Err(Error::BusStuck { what: "flash busy", .. })
        ));
    }

    #[test]
    fn erase_gets_its_own_timeout() {
        let timeouts = Timeouts::default();
        assert_eq!(
            timeouts.instruction(&CustomInstruction::chip_erase()).timeout,
            timing::ERASE_TIMEOUT
        );
        assert_eq!(
            timeouts.instruction(&CustomInstruction::read_id()).timeout,
            timing::INSTRUCTION_TIMEOUT
        );
    }
}

//! In-memory RTD2662 emulator.
//!
//! Models the ISP register file, the custom instruction engine, page
//! programming, the CRC unit and an attached SPI flash. [`Emulator`] answers
//! byte transactions directly; [`EmulatorLines`] puts the same device behind a
//! simulated open-drain bus so [`SoftwareI2c`] can drive it bit by bit.

use std::collections::BTreeMap;

use crate::constants::{ISP_ADDRESS, ISP_AUTOINC_ADDRESS, opcodes, registers};
use crate::crc::crc8;
use crate::error::{Error, Result};
use crate::protocol::{ControlRegister, InstructionKind, IspStatus, be_bytes, from_be_bytes};
use crate::transport::software_i2c::{Line, LineDriver, SoftwareI2c};
use crate::transport::{I2cTransport, Settings};

pub const HELP: &str = "Emulated controller with a W25X40 (512 KiB) flash.
OPTIONS (-s key=value,...):
  size=<bytes>       flash size (default 524288)
  jedec=<hex>        JEDEC id reported by RDID (default ef3013)
  max_read=<n>       largest read transaction, 0 = unlimited
  max_write=<n>      largest write transaction, 0 = unlimited";

const DEFAULT_FLASH_SIZE: usize = 512 * 1024;
const DEFAULT_JEDEC_ID: u32 = 0xEF3013;

/// Status register protection bits (BP0..BP2).
const BLOCK_PROTECT: u8 = 0x1C;

/// Transaction counters, for checking how much traffic an operation causes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    pub writes: usize,
    pub reads: usize,
    pub pages_programmed: usize,
    pub erases: usize,
}

#[derive(Debug, Clone)]
pub struct Emulator {
    regs: [u8; 256],
    pointer: u8,
    flash: Vec<u8>,
    jedec_id: u32,
    /// SPI flash status register.
    flash_status: u8,
    page_buffer: Vec<u8>,
    stream_address: usize,
    isp: bool,
    crc_done: bool,
    busy_polls: u32,
    busy_remaining: u32,
    present: bool,
    nack_writes: bool,
    /// Writes that succeed before every further write is refused.
    writes_before_nack: Option<usize>,
    stall_instructions: bool,
    stall_crc: bool,
    max_read: usize,
    max_write: usize,
    stats: EmulatorStats,
}

impl Default for Emulator {
    fn default() -> Self {
        Emulator {
            regs: [0; 256],
            pointer: 0,
            flash: vec![0xFF; DEFAULT_FLASH_SIZE],
            jedec_id: DEFAULT_JEDEC_ID,
            flash_status: BLOCK_PROTECT,
            page_buffer: Vec::new(),
            stream_address: 0,
            isp: false,
            crc_done: false,
            busy_polls: 0,
            busy_remaining: 0,
            present: true,
            nack_writes: false,
            writes_before_nack: None,
            stall_instructions: false,
            stall_crc: false,
            max_read: 0,
            max_write: 0,
            stats: EmulatorStats::default(),
        }
    }
}

impl Emulator {
    pub fn with_contents(mut self, contents: Vec<u8>) -> Self {
        self.flash = contents;
        self
    }

    pub fn with_jedec_id(mut self, jedec_id: u32) -> Self {
        self.jedec_id = jedec_id;
        self
    }

    pub fn with_limits(mut self, max_read: usize, max_write: usize) -> Self {
        self.max_read = max_read;
        self.max_write = max_write;
        self
    }

    /// Report busy for `polls` status reads after every page program.
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Acknowledge addresses but refuse every write transaction.
    pub fn nack_writes(mut self) -> Self {
        self.nack_writes = true;
        self
    }

    /// Stop acknowledging writes after `writes` successful ones, like a
    /// controller that drops off the bus mid-operation.
    pub fn nack_after_writes(mut self, writes: usize) -> Self {
        self.writes_before_nack = Some(writes);
        self
    }

    /// Custom instructions never complete: the start bit of 0x60 stays set.
    pub fn stall_instructions(mut self) -> Self {
        self.stall_instructions = true;
        self
    }

    /// The CRC unit never reports completion.
    pub fn stall_crc(mut self) -> Self {
        self.stall_crc = true;
        self
    }

    /// Nothing answers at the controller address.
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn stats(&self) -> EmulatorStats {
        self.stats
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.regs[reg as usize]
    }

    pub fn isp_enabled(&self) -> bool {
        self.isp
    }

    pub fn flash_protected(&self) -> bool {
        self.flash_status & BLOCK_PROTECT != 0
    }

    fn acknowledges(&self, address: u8) -> bool {
        self.present && (address == ISP_ADDRESS || address == ISP_AUTOINC_ADDRESS)
    }

    fn handle_write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        if !self.acknowledges(address) {
            return Err(Error::NoAck { address });
        }
        let Some((&reg, payload)) = data.split_first() else {
            return Ok(());
        };
        self.pointer = reg;
        for &value in payload {
            self.write_register(self.pointer, value);
            if address == ISP_AUTOINC_ADDRESS {
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
        Ok(())
    }

    fn read_next(&mut self, address: u8) -> u8 {
        let value = self.read_register(self.pointer);
        if address == ISP_AUTOINC_ADDRESS {
            self.pointer = self.pointer.wrapping_add(1);
        }
        value
    }

    fn operand(&self, first: u8, len: usize) -> u32 {
        let start = first as usize;
        from_be_bytes(&self.regs[start..start + len]).unwrap_or(0)
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            registers::ISP_STATUS => {
                let status = IspStatus::from_raw(value);
                self.isp = status.isp_enabled();
                if self.isp && status.program_start() {
                    self.program_page();
                }
                if self.isp && status.crc_start() {
                    self.compute_crc();
                }
            }
            registers::CONTROL => {
                let control = ControlRegister::from_raw(value);
                if self.stall_instructions {
                    self.regs[reg as usize] = value;
                    return;
                }
                if self.isp && control.start() {
                    self.execute(control);
                }
                let mut done = control;
                done.set_start(false);
                self.regs[reg as usize] = done.raw();
            }
            registers::DATA_PORT => self.page_buffer.push(value),
            registers::MCU_CONTROL if value == registers::REBOOT => {
                log::debug!("emulator: MCU reboot, leaving ISP");
                self.isp = false;
                self.crc_done = false;
            }
            _ => self.regs[reg as usize] = value,
        }
    }

    fn read_register(&mut self, reg: u8) -> u8 {
        match reg {
            registers::ISP_STATUS => {
                let mut status = IspStatus::from_raw(0);
                status.set_isp_enabled(self.isp);
                status.set_crc_done(self.crc_done);
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    status.set_busy(true);
                }
                status.raw()
            }
            registers::DATA_PORT => {
                let value = self.flash.get(self.stream_address).copied().unwrap_or(0xFF);
                self.stream_address += 1;
                value
            }
            _ => self.regs[reg as usize],
        }
    }

    fn execute(&mut self, control: ControlRegister) {
        let opcode = self.regs[registers::OPCODE as usize];
        let kind = InstructionKind::try_from(control.kind());
        let operand = self.operand(registers::WRITE_OPERAND, control.write_len() as usize);
        log::trace!("emulator: instruction {:?} 0x{:02x} operand 0x{:x}", kind, opcode, operand);

        let result = match (kind, opcode) {
            (Ok(InstructionKind::WriteAfterWren | InstructionKind::WriteAfterEwsr), opcodes::WRSR) => {
                self.flash_status = operand as u8;
                0
            }
            (Ok(InstructionKind::Erase), opcodes::CHIP_ERASE) => {
                if self.flash_protected() {
                    log::warn!("emulator: chip erase ignored, flash is protected");
                } else {
                    self.flash.fill(0xFF);
                    self.stats.erases += 1;
                }
                0
            }
            (Ok(InstructionKind::Read), opcodes::RDID) => self.jedec_id,
            (Ok(InstructionKind::Read), opcodes::RDSR) => self.flash_status as u32,
            (Ok(InstructionKind::Read), opcodes::READ) => {
                self.stream_address = operand as usize;
                0
            }
            _ => {
                log::warn!("emulator: unsupported instruction {:?} 0x{:02x}", kind, opcode);
                0
            }
        };

        let read_len = control.read_len() as usize;
        if let Ok(bytes) = be_bytes(result, read_len) {
            let start = registers::READ_RESULT as usize;
            self.regs[start..start + read_len].copy_from_slice(&bytes);
        }
    }

    fn program_page(&mut self) {
        let address = self.operand(registers::WRITE_OPERAND, 3) as usize;
        let len = self.regs[registers::PROGRAM_SIZE as usize] as usize + 1;
        let data: Vec<u8> = self.page_buffer.drain(..).collect();
        if data.len() != len {
            log::warn!("emulator: page size register says {} bytes, {} buffered", len, data.len());
        }
        if self.flash_protected() {
            log::warn!("emulator: page program at 0x{:06x} ignored, flash is protected", address);
            return;
        }
        for (offset, value) in data.into_iter().take(len).enumerate() {
            // programming can only clear bits
            if let Some(cell) = self.flash.get_mut(address + offset) {
                *cell &= value;
            }
        }
        self.stats.pages_programmed += 1;
        self.busy_remaining = self.busy_polls;
    }

    fn compute_crc(&mut self) {
        let start = self.operand(registers::WRITE_OPERAND, 3) as usize;
        let end = self.operand(registers::CRC_END, 3) as usize;
        let end = end.min(self.flash.len().saturating_sub(1));
        let crc = if start <= end {
            crc8(&self.flash[start..=end])
        } else {
            0
        };
        self.regs[registers::CRC_RESULT as usize] = crc;
        self.crc_done = !self.stall_crc;
    }
}

impl I2cTransport for Emulator {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        Ok(BTreeMap::from([(
            0,
            format!(
                "RTD2662 emulator (JEDEC {:06x}, {} KiB)",
                self.jedec_id,
                self.flash.len() / 1024
            ),
        )]))
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        if device != 0 {
            return Err(Error::DeviceNotFound(device));
        }
        let mut settings = Settings::parse(settings)?;
        if let Some(size) = settings.take::<usize>("size")? {
            self.flash = vec![0xFF; size];
        }
        if let Some(jedec) = settings.take::<String>("jedec")? {
            self.jedec_id = u32::from_str_radix(jedec.trim_start_matches("0x"), 16)
                .map_err(|_| Error::InvalidSettings(format!("bad JEDEC id '{}'", jedec)))?;
        }
        if let Some(max_read) = settings.take("max_read")? {
            self.max_read = max_read;
        }
        if let Some(max_write) = settings.take("max_write")? {
            self.max_write = max_write;
        }
        settings.finish()
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        self.stats.writes += 1;
        log::trace!("emulator: write 0x{:02x} {}", address, hex::encode(data));
        if self.max_write != 0 && data.len() > self.max_write {
            return Err(Error::Transport(format!(
                "write of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_write
            )));
        }
        let dropped = self
            .writes_before_nack
            .is_some_and(|n| self.stats.writes > n);
        if (self.nack_writes || dropped) && self.acknowledges(address) {
            return Err(Error::NoAck { address });
        }
        self.handle_write(address, data)
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        self.stats.reads += 1;
        if self.max_read != 0 && count > self.max_read {
            return Err(Error::Transport(format!(
                "read of {} bytes exceeds the {} byte limit",
                count, self.max_read
            )));
        }
        if !self.acknowledges(address) {
            return Err(Error::NoAck { address });
        }
        Ok((0..count).map(|_| self.read_next(address)).collect())
    }

    fn max_read(&self) -> usize {
        self.max_read
    }

    fn max_write(&self) -> usize {
        self.max_write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Address,
    Write,
    Read,
    /// Not addressed, or the master ended a read with NACK.
    Ignore,
}

/// The emulator as an I2C slave on simulated open-drain lines.
#[derive(Debug, Clone)]
pub struct EmulatorLines {
    device: Emulator,
    master_sda: bool,
    master_scl: bool,
    slave_sda: bool,
    phase: Phase,
    /// The master pulls SCL low right after START; that edge ends no bit.
    after_start: bool,
    /// Clocks completed in the current byte, ACK clock included.
    clocks: u8,
    shift: u8,
    address: u8,
    reading: bool,
    rx: Vec<u8>,
    tx: u8,
    master_nack: bool,
    stretch: u32,
    stretch_remaining: u32,
    hold_sda: u32,
}

impl EmulatorLines {
    pub fn new(device: Emulator) -> Self {
        EmulatorLines {
            device,
            master_sda: true,
            master_scl: true,
            slave_sda: true,
            phase: Phase::Idle,
            after_start: false,
            clocks: 0,
            shift: 0,
            address: 0,
            reading: false,
            rx: Vec::new(),
            tx: 0xFF,
            master_nack: false,
            stretch: 0,
            stretch_remaining: 0,
            hold_sda: 0,
        }
    }

    /// Hold SCL low for `polls` releases after every clock pulse.
    pub fn with_stretch(mut self, polls: u32) -> Self {
        self.stretch = polls;
        self
    }

    /// Keep SDA low for the next `clocks` clock pulses, like a slave
    /// interrupted in the middle of a byte.
    pub fn hold_sda_for(&mut self, clocks: u32) {
        self.hold_sda = clocks;
        self.slave_sda = false;
    }

    pub fn device(&self) -> &Emulator {
        &self.device
    }

    fn sda(&self) -> bool {
        self.master_sda && self.slave_sda
    }

    fn set(&mut self, line: Line, level: bool) {
        let (sda, scl) = (self.sda(), self.master_scl);
        match line {
            Line::Sda => self.master_sda = level,
            Line::Scl => self.master_scl = level,
        }
        let (new_sda, new_scl) = (self.sda(), self.master_scl);

        if scl && new_scl && sda != new_sda {
            if new_sda {
                self.stop_condition();
            } else {
                self.start_condition();
            }
        } else if !scl && new_scl {
            self.rising_edge(new_sda);
        } else if scl && !new_scl {
            self.falling_edge();
        }
    }

    fn start_condition(&mut self) {
        self.phase = Phase::Address;
        self.after_start = true;
        self.clocks = 0;
        self.shift = 0;
        self.rx.clear();
        self.slave_sda = true;
    }

    fn stop_condition(&mut self) {
        if self.phase == Phase::Write {
            let rx = std::mem::take(&mut self.rx);
            if let Err(e) = self.device.write(self.address, &rx) {
                log::debug!("emulator lines: write rejected: {}", e);
            }
        }
        self.phase = Phase::Idle;
        self.after_start = false;
        self.slave_sda = true;
    }

    fn rising_edge(&mut self, sda: bool) {
        match self.phase {
            Phase::Address | Phase::Write if self.clocks < 8 => {
                self.shift = (self.shift << 1) | sda as u8;
            }
            Phase::Read if self.clocks == 8 => self.master_nack = sda,
            _ => {}
        }
    }

    fn falling_edge(&mut self) {
        if self.hold_sda > 0 {
            self.hold_sda -= 1;
            if self.hold_sda == 0 {
                self.slave_sda = true;
            }
        }
        if matches!(self.phase, Phase::Idle | Phase::Ignore) {
            return;
        }
        if self.after_start {
            self.after_start = false;
            return;
        }
        self.clocks += 1;
        match (self.phase, self.clocks) {
            (Phase::Address, 8) => {
                self.address = self.shift >> 1;
                self.reading = self.shift & 1 == 1;
                if self.device.acknowledges(self.address) {
                    self.slave_sda = false;
                } else {
                    self.phase = Phase::Ignore;
                }
            }
            (Phase::Write, 8) => {
                self.rx.push(self.shift);
                self.slave_sda = false;
            }
            (Phase::Address | Phase::Write, 9) => {
                self.slave_sda = true;
                self.clocks = 0;
                self.shift = 0;
                if self.phase == Phase::Address {
                    if self.reading {
                        self.phase = Phase::Read;
                        self.load_next_byte();
                    } else {
                        self.phase = Phase::Write;
                    }
                }
            }
            (Phase::Read, 1..=7) => {
                self.slave_sda = self.tx & (0x80 >> self.clocks) != 0;
            }
            (Phase::Read, 8) => self.slave_sda = true,
            (Phase::Read, 9) => {
                self.clocks = 0;
                if self.master_nack {
                    self.phase = Phase::Ignore;
                    self.slave_sda = true;
                } else {
                    self.load_next_byte();
                }
            }
            _ => {}
        }
    }

    fn load_next_byte(&mut self) {
        self.device.stats.reads += 1;
        self.tx = self.device.read_next(self.address);
        self.slave_sda = self.tx & 0x80 != 0;
    }
}

impl LineDriver for EmulatorLines {
    fn drive_low(&mut self, line: Line) -> Result<()> {
        if line == Line::Scl {
            self.stretch_remaining = self.stretch;
        }
        self.set(line, false);
        Ok(())
    }

    fn release(&mut self, line: Line) -> Result<bool> {
        match line {
            Line::Sda => {
                self.set(Line::Sda, true);
                Ok(self.sda())
            }
            Line::Scl if self.stretch_remaining > 0 => {
                self.stretch_remaining -= 1;
                Ok(false)
            }
            Line::Scl => {
                self.set(Line::Scl, true);
                Ok(true)
            }
        }
    }
}

impl I2cTransport for SoftwareI2c<EmulatorLines> {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        Ok(BTreeMap::from([(0, "RTD2662 emulator (bit-banged)".to_string())]))
    }

    fn init(&mut self, device: u32, _settings: Option<&str>) -> Result<()> {
        if device != 0 {
            return Err(Error::DeviceNotFound(device));
        }
        self.reset()
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        SoftwareI2c::write(self, address, data)
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        SoftwareI2c::read(self, address, count)
    }
}

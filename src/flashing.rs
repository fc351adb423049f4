//! Chip flashing logic.

use crate::constants::{MAX_FLASH_SIZE, PAGE_SIZE, opcodes, registers, status};
use crate::crc::crc8;
use crate::device::{ChipDB, FlashChip};
use crate::error::{Error, Result};
use crate::protocol::{CustomInstruction, IspStatus, be_bytes};
use crate::session::Session;
use crate::transport::I2cTransport;

/// Data bytes streamed per data port read.
const READ_CHUNK_SIZE: usize = 128;

pub struct Flashing<T: I2cTransport> {
    session: Session<T>,
    jedec_id: u32,
    chip: Option<FlashChip>,
}

impl<T: I2cTransport> Flashing<T> {
    /// Identify the attached flash. The session must be initialized; ISP mode
    /// is entered if it isn't already.
    pub fn new(mut session: Session<T>, db: &ChipDB) -> Result<Self> {
        session.enter_isp()?;

        let jedec_id = session.execute(&CustomInstruction::read_id())?;
        let chip = db.find(jedec_id).cloned();
        match &chip {
            Some(chip) => log::debug!("found flash: {}", chip),
            None => log::warn!("Unknown flash chip, JEDEC id {:06x}", jedec_id),
        }

        let mut f = Flashing {
            session,
            jedec_id,
            chip,
        };
        f.setup_opcodes()?;
        Ok(f)
    }

    /// Tell the ISP engine which SPI opcodes to use for its own sequences.
    fn setup_opcodes(&mut self) -> Result<()> {
        for (reg, opcode) in [
            (registers::WREN_OPCODE, opcodes::WREN),
            (registers::EWSR_OPCODE, opcodes::EWSR),
            (registers::READ_OPCODE, opcodes::READ),
            (registers::PROGRAM_OPCODE, opcodes::PROGRAM),
            (registers::RDSR_OPCODE, opcodes::RDSR),
        ] {
            self.session.write_reg(reg, &[opcode])?;
        }
        Ok(())
    }

    pub fn dump_info(&self) {
        match &self.chip {
            Some(chip) => log::info!(
                "Flash: {} (JEDEC {:06x}, {}KiB, unprotect via {:?})",
                chip.name,
                self.jedec_id,
                chip.size / 1024,
                chip.unprotect
            ),
            None => log::info!("Flash: unknown (JEDEC {:06x})", self.jedec_id),
        }
    }

    pub fn jedec_id(&self) -> u32 {
        self.jedec_id
    }

    pub fn chip(&self) -> Option<&FlashChip> {
        self.chip.as_ref()
    }

    pub fn flash_size(&self) -> Option<u32> {
        self.chip.as_ref().map(|c| c.size)
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn into_session(self) -> Session<T> {
        self.session
    }

    fn write_status(&mut self, value: u32) -> Result<()> {
        let unprotect = self.chip.as_ref().map(|c| c.unprotect).unwrap_or_default();
        let wrsr = CustomInstruction::write_status(unprotect.instruction_kind(), value);
        self.session.execute(&wrsr)?;
        Ok(())
    }

    pub fn unprotect(&mut self) -> Result<()> {
        log::debug!("Unprotecting status register");
        self.write_status(status::UNPROTECTED)
    }

    pub fn protect(&mut self) -> Result<()> {
        log::debug!("Protecting status register");
        self.write_status(status::PROTECTED)
    }

    pub fn erase(&mut self) -> Result<()> {
        self.unprotect()?;
        self.session.execute(&CustomInstruction::chip_erase())?;
        self.protect()?;
        log::info!("Flash erased");
        Ok(())
    }

    /// Program `data` from address 0 and check it with the device CRC.
    ///
    /// Pages that are all 0xFF are skipped, so the flash must be erased first
    /// for them to end up as 0xFF.
    pub fn program<F>(&mut self, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(u32, u32, u32),
    {
        let capacity = self
            .chip
            .as_ref()
            .map_or(MAX_FLASH_SIZE, |c| c.size.min(MAX_FLASH_SIZE));
        if data.len() > capacity as usize {
            return Err(Error::ImageTooLarge {
                size: data.len(),
                capacity,
            });
        }
        if data.is_empty() {
            log::warn!("Nothing to program");
            return Ok(());
        }
        let len = data.len() as u32;

        self.unprotect()?;
        let mut skipped = 0;
        for (i, page) in data.chunks(PAGE_SIZE).enumerate() {
            let address = (i * PAGE_SIZE) as u32;
            progress(0, len, address);
            if page.iter().all(|&b| b == 0xFF) {
                skipped += 1;
                continue;
            }
            self.program_page(address, page)?;
        }
        self.session.wait_not_busy()?;
        self.protect()?;
        progress(0, len, len);
        log::debug!("{} blank pages skipped", skipped);

        self.check_crc(data)
    }

    fn program_page(&mut self, address: u32, page: &[u8]) -> Result<()> {
        self.session.wait_not_busy()?;
        self.session
            .write_reg(registers::PROGRAM_SIZE, &[(page.len() - 1) as u8])?;
        self.session
            .write_regs(registers::WRITE_OPERAND, &be_bytes(address, 3)?)?;
        self.session.write_reg(registers::DATA_PORT, page)?;
        self.session
            .write_reg(registers::ISP_STATUS, &[IspStatus::start_program().raw()])
    }

    /// Read `size` bytes from address 0 and check them with the device CRC.
    pub fn read<F>(&mut self, size: u32, mut progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(u32, u32, u32),
    {
        if size > MAX_FLASH_SIZE {
            return Err(Error::ReadTooLarge {
                size,
                limit: MAX_FLASH_SIZE,
            });
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        self.session.execute(&CustomInstruction::read_stream(0))?;
        self.session.wait_not_busy()?;

        let mut data = Vec::with_capacity(size as usize);
        while data.len() < size as usize {
            progress(0, size, data.len() as u32);
            let n = READ_CHUNK_SIZE.min(size as usize - data.len());
            data.extend(self.session.read_fifo(registers::DATA_PORT, n)?);
        }
        progress(0, size, size);

        self.check_crc(&data)?;
        Ok(data)
    }

    /// Read back the flash and compare it with `expected`.
    pub fn verify(&mut self, expected: &[u8]) -> Result<()> {
        let actual = self.read(expected.len() as u32, |_, _, _| ())?;
        if let Some(offset) = actual.iter().zip(expected).position(|(a, e)| a != e) {
            let row = offset & !0xF;
            let end = (row + 16).min(expected.len());
            log::error!("First mismatch at 0x{:06x}", offset);
            log::error!("expected:\n{}", dump(&expected[row..end]));
            log::error!("flash:\n{}", dump(&actual[row..end]));
            return Err(Error::VerificationFailed {
                host: crc8(expected),
                device: crc8(&actual),
            });
        }
        log::info!("Verified {} bytes", expected.len());
        Ok(())
    }

    fn check_crc(&mut self, data: &[u8]) -> Result<()> {
        let host = crc8(data);
        let device = self.session.device_crc(0, data.len() as u32 - 1)?;
        log::debug!("CRC host 0x{:02x}, device 0x{:02x}", host, device);
        if host != device {
            return Err(Error::VerificationFailed { host, device });
        }
        Ok(())
    }

    /// Leave ISP mode and let the controller boot the new firmware.
    pub fn reset(&mut self) {
        self.session.exit_isp();
        log::info!("Device reset");
    }

    /// Reboot the controller and release the transport. A halted
    /// controller keeps the panel dark until it is power cycled.
    pub fn close(mut self) -> Result<Session<T>> {
        self.reset();
        self.session.deinit()?;
        Ok(self.session)
    }
}

fn dump(data: &[u8]) -> String {
    let mut out = Vec::new();
    if hxdmp::hexdump(data, &mut out).is_err() {
        return hex::encode(data);
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Emulator;

    fn flashing(emulator: Emulator) -> Flashing<Emulator> {
        let mut session = Session::new(emulator);
        session.init(0, None).unwrap();
        Flashing::new(session, &ChipDB::load().unwrap()).unwrap()
    }

    #[test]
    fn identifies_chip_and_sets_opcodes() {
        let f = flashing(Emulator::default().with_jedec_id(0xC22013));
        assert_eq!(f.jedec_id(), 0xC22013);
        assert_eq!(f.chip().unwrap().name, "MX25L4005");
        let emulator = f.session().transport();
        assert_eq!(emulator.register(registers::WREN_OPCODE), opcodes::WREN);
        assert_eq!(emulator.register(registers::EWSR_OPCODE), opcodes::EWSR);
        assert_eq!(emulator.register(registers::READ_OPCODE), opcodes::READ);
        assert_eq!(emulator.register(registers::PROGRAM_OPCODE), opcodes::PROGRAM);
        assert_eq!(emulator.register(registers::RDSR_OPCODE), opcodes::RDSR);
    }

    #[test]
    fn unknown_chip_is_allowed() {
        let f = flashing(Emulator::default().with_jedec_id(0x123456));
        assert!(f.chip().is_none());
        assert_eq!(f.flash_size(), None);
    }

    #[test]
    fn erase_leaves_flash_blank_and_protected() {
        let mut f = flashing(Emulator::default().with_contents(vec![0x00; 512 * 1024]));
        f.erase().unwrap();
        let emulator = f.session().transport();
        assert!(emulator.flash().iter().all(|&b| b == 0xFF));
        assert!(emulator.flash_protected());
    }

    #[test]
    fn ewsr_part_is_unlocked_with_ewsr() {
        let mut f = flashing(
            Emulator::default()
                .with_jedec_id(0xBF258D)
                .with_contents(vec![0x00; 4096]),
        );
        f.erase().unwrap();
        assert!(f.session().transport().flash().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn program_reports_progress_per_page() {
        let mut f = flashing(Emulator::default());
        let data = vec![0x5A; 3 * PAGE_SIZE + 10];
        let mut calls = vec![];
        f.program(&data, |start, end, cur| calls.push((start, end, cur)))
            .unwrap();
        let len = data.len() as u32;
        assert_eq!(
            calls,
            vec![(0, len, 0), (0, len, 128), (0, len, 256), (0, len, 384), (0, len, len)]
        );
        assert_eq!(&f.session().transport().flash()[..data.len()], &data[..]);
    }

    #[test]
    fn program_skips_blank_pages() {
        let mut f = flashing(Emulator::default());
        let mut data = vec![0xFF; 4 * PAGE_SIZE];
        data[PAGE_SIZE + 3] = 0x12;
        f.program(&data, |_, _, _| ()).unwrap();
        assert_eq!(f.session().transport().stats().pages_programmed, 1);
    }

    #[test]
    fn program_rejects_oversized_image() {
        let mut f = flashing(Emulator::default().with_jedec_id(0xEF3012));
        let err = f.program(&vec![0; 256 * 1024 + 1], |_, _, _| ()).unwrap_err();
        assert!(matches!(err, Error::ImageTooLarge { .. }));
    }

    #[test]
    fn program_over_dirty_flash_fails_verification() {
        let mut f = flashing(Emulator::default().with_contents(vec![0x00; 512 * 1024]));
        let err = f.program(&[0xA5; 256], |_, _, _| ()).unwrap_err();
        assert!(err.is_verification_failure());
    }

    #[test]
    fn read_returns_flash_contents() {
        let contents: Vec<u8> = (0..8192u32).map(|i| (i * 7) as u8).collect();
        let mut f = flashing(Emulator::default().with_contents(contents.clone()));
        let mut last = None;
        let data = f.read(8192, |_, _, cur| last = Some(cur)).unwrap();
        assert_eq!(data, contents);
        assert_eq!(last, Some(8192));
    }

    #[test]
    fn verify_detects_mismatch() {
        let contents = vec![0x11; 1024];
        let mut f = flashing(Emulator::default().with_contents(contents.clone()));
        f.verify(&contents).unwrap();

        let mut expected = contents.clone();
        expected[300] = 0x22;
        assert!(f.verify(&expected).unwrap_err().is_verification_failure());
    }
}

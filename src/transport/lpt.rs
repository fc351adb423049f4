//! Bit-banged I2C on a PC parallel port, using the inpout driver for port I/O.
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use libloading::Library;

use super::software_i2c::{HALF_PERIOD, Line, LineDriver, SoftwareI2c};
use super::{I2cTransport, Settings};
use crate::error::{Error, Result};

pub const HELP: &str = "Bit-bangs SDA/SCL on a parallel port through inpout32.dll/inpoutx64.dll.
Outputs need an open-drain stage towards the bus.
OPTIONS (-s key=value,...):
  sda_out=<pin>       default D7
  scl_out=<pin>       default SELPRINTER
  sda_in=<pin>        default BUSY
  scl_in=<pin>        default ERROR
  half_period_us=<n>  settle time per transition (default 5)
Output pins: D0..D7, STROBE, FEED, RESET, SELPRINTER
Input pins: ACK, BUSY, PAPER, SELIN, ERROR";

#[cfg(target_pointer_width = "64")]
const DLL_NAME: &str = "inpoutx64.dll";
#[cfg(not(target_pointer_width = "64"))]
const DLL_NAME: &str = "inpout32.dll";

const PORTS: [(u32, &str); 3] = [(0x3BC, "LPT1"), (0x378, "LPT2"), (0x278, "LPT3")];

type Inp32 = unsafe extern "system" fn(port: i16) -> i16;
type Out32 = unsafe extern "system" fn(port: i16, value: i16);
type IsDriverOpen = unsafe extern "system" fn() -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    Data = 0,
    Status = 1,
    Control = 2,
}

/// A parallel port signal: register, bit and whether the hardware inverts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin {
    register: Register,
    bit: u8,
    inverted: bool,
    output: bool,
}

impl Pin {
    const fn new(register: Register, bit: u8, inverted: bool) -> Self {
        Pin {
            register,
            bit,
            inverted,
            output: !matches!(register, Register::Status),
        }
    }
}

impl FromStr for Pin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let pin = match s.to_ascii_uppercase().as_str() {
            "D0" => Pin::new(Register::Data, 0, false),
            "D1" => Pin::new(Register::Data, 1, false),
            "D2" => Pin::new(Register::Data, 2, false),
            "D3" => Pin::new(Register::Data, 3, false),
            "D4" => Pin::new(Register::Data, 4, false),
            "D5" => Pin::new(Register::Data, 5, false),
            "D6" => Pin::new(Register::Data, 6, false),
            "D7" => Pin::new(Register::Data, 7, false),
            "ERROR" => Pin::new(Register::Status, 3, false),
            "SELIN" => Pin::new(Register::Status, 4, false),
            "PAPER" => Pin::new(Register::Status, 5, false),
            "ACK" => Pin::new(Register::Status, 6, false),
            "BUSY" => Pin::new(Register::Status, 7, true),
            "STROBE" => Pin::new(Register::Control, 0, true),
            "FEED" => Pin::new(Register::Control, 1, true),
            "RESET" => Pin::new(Register::Control, 2, false),
            "SELPRINTER" => Pin::new(Register::Control, 3, true),
            other => return Err(format!("unknown parallel port pin '{}'", other)),
        };
        Ok(pin)
    }
}

#[derive(Debug, Clone, Copy)]
struct PinMap {
    sda_out: Pin,
    scl_out: Pin,
    sda_in: Pin,
    scl_in: Pin,
}

impl PinMap {
    fn from_settings(settings: &mut Settings) -> Result<Self> {
        let mut pin = |key: &str, default: &str| -> Result<Pin> {
            let name = settings
                .take::<String>(key)?
                .unwrap_or_else(|| default.to_string());
            name.parse::<Pin>().map_err(Error::InvalidSettings)
        };
        let map = PinMap {
            sda_out: pin("sda_out", "D7")?,
            scl_out: pin("scl_out", "SELPRINTER")?,
            sda_in: pin("sda_in", "BUSY")?,
            scl_in: pin("scl_in", "ERROR")?,
        };
        if !map.sda_out.output || !map.scl_out.output {
            return Err(Error::InvalidSettings(
                "status register pins cannot drive the bus".into(),
            ));
        }
        if map.sda_out == map.scl_out {
            return Err(Error::InvalidSettings("SDA and SCL share an output pin".into()));
        }
        Ok(map)
    }
}

struct Port {
    inp32: Inp32,
    out32: Out32,
}

pub struct PortLines {
    port: Port,
    base: u16,
    map: PinMap,
}

impl PortLines {
    fn io(&self, register: Register) -> i16 {
        (self.base + register as u16) as i16
    }

    fn set(&mut self, pin: Pin, high: bool) {
        let addr = self.io(pin.register);
        // SAFETY: port I/O through the driver, address is a parallel port register
        unsafe {
            let value = (self.port.inp32)(addr) as u8;
            let level = high ^ pin.inverted;
            let value = (value & !(1 << pin.bit)) | ((level as u8) << pin.bit);
            (self.port.out32)(addr, value as i16);
        }
    }

    fn get(&self, pin: Pin) -> bool {
        // SAFETY: see `set`
        let value = unsafe { (self.port.inp32)(self.io(pin.register)) } as u8;
        (value >> pin.bit & 1 != 0) ^ pin.inverted
    }

    fn output(&self, line: Line) -> Pin {
        match line {
            Line::Sda => self.map.sda_out,
            Line::Scl => self.map.scl_out,
        }
    }
}

impl LineDriver for PortLines {
    fn drive_low(&mut self, line: Line) -> Result<()> {
        self.set(self.output(line), false);
        Ok(())
    }

    fn release(&mut self, line: Line) -> Result<bool> {
        self.set(self.output(line), true);
        let input = match line {
            Line::Sda => self.map.sda_in,
            Line::Scl => self.map.scl_in,
        };
        Ok(self.get(input))
    }
}

pub struct Lpt {
    inp32: Inp32,
    out32: Out32,
    bus: Option<SoftwareI2c<PortLines>>,
    _library: Library,
}

impl Lpt {
    pub fn load() -> Result<Self> {
        log::debug!("Loading {}", DLL_NAME);
        // SAFETY: inpout exports plain stdcall functions
        unsafe {
            let library = Library::new(DLL_NAME)?;
            let inp32 = *library.get::<Inp32>(b"Inp32\0")?;
            let out32 = *library.get::<Out32>(b"Out32\0")?;
            let is_open = *library.get::<IsDriverOpen>(b"IsInpOutDriverOpen\0")?;
            if is_open() == 0 {
                return Err(Error::Transport(format!(
                    "{} is loaded but its kernel driver is not running (run once as administrator)",
                    DLL_NAME
                )));
            }
            Ok(Lpt {
                inp32,
                out32,
                bus: None,
                _library: library,
            })
        }
    }

    fn bus(&mut self) -> Result<&mut SoftwareI2c<PortLines>> {
        self.bus.as_mut().ok_or(Error::NotInitialized)
    }
}

impl I2cTransport for Lpt {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        Ok(PORTS
            .iter()
            .map(|&(base, name)| (base, format!("{} (0x{:03x})", name, base)))
            .collect())
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        let base = PORTS
            .iter()
            .find(|&&(base, _)| base == device)
            .map(|&(base, _)| base as u16)
            .ok_or(Error::DeviceNotFound(device))?;

        let mut settings = Settings::parse(settings)?;
        let map = PinMap::from_settings(&mut settings)?;
        let half_period = settings
            .take::<u64>("half_period_us")?
            .map(Duration::from_micros)
            .unwrap_or(HALF_PERIOD);
        settings.finish()?;

        let lines = PortLines {
            port: Port {
                inp32: self.inp32,
                out32: self.out32,
            },
            base,
            map,
        };
        let mut bus = SoftwareI2c::new(lines).with_half_period(half_period);
        bus.reset()?;
        self.bus = Some(bus);
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(mut bus) = self.bus.take() {
            let lines = bus.lines_mut();
            lines.release(Line::Sda)?;
            lines.release(Line::Scl)?;
        }
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        self.bus()?.write(address, data)
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        self.bus()?.read(address, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_names() {
        let busy: Pin = "busy".parse().unwrap();
        assert_eq!(busy.register, Register::Status);
        assert!(busy.inverted && !busy.output);
        let sel: Pin = "SELPRINTER".parse().unwrap();
        assert_eq!((sel.register, sel.bit), (Register::Control, 3));
        assert!("D8".parse::<Pin>().is_err());
    }

    #[test]
    fn default_pin_map() {
        let mut settings = Settings::parse(None).unwrap();
        let map = PinMap::from_settings(&mut settings).unwrap();
        assert_eq!(map.sda_out, "D7".parse().unwrap());
        assert_eq!(map.scl_in, "ERROR".parse().unwrap());
    }

    #[test]
    fn input_pin_cannot_drive() {
        let mut settings = Settings::parse(Some("sda_out=ACK")).unwrap();
        assert!(PinMap::from_settings(&mut settings).is_err());
    }
}

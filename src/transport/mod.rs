//! Abstract I2C transport interface and the backend registry.
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::constants::ISP_ADDRESS;
use crate::error::{Error, Result};

pub use self::emulator::{Emulator, EmulatorLines};
pub use self::software_i2c::{Line, LineDriver, SoftwareI2c};

pub mod emulator;
pub mod software_i2c;

mod ch341;
#[cfg(target_os = "linux")]
mod i2cdev;
mod lpt;
mod mcp2221;
mod serial;

/// Capability set every programming adapter provides.
///
/// Devices are numbered by the backend; `list_devices` maps those numbers to
/// human readable names. One session at a time: callers serialise
/// `init -> [detect | read | write]* -> deinit`.
pub trait I2cTransport {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>>;

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()>;

    fn deinit(&mut self) -> Result<()>;

    /// Write `data` to the 7-bit `address` in one transaction.
    fn write(&mut self, address: u8, data: &[u8]) -> Result<()>;

    /// Read `count` bytes from the 7-bit `address` in one transaction.
    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>>;

    /// Largest single read, 0 for unlimited.
    fn max_read(&self) -> usize {
        0
    }

    /// Largest single write including the register byte, 0 for unlimited.
    fn max_write(&self) -> usize {
        0
    }

    fn detect(&mut self, address: u8) -> Result<bool> {
        match self.read(address, 1) {
            Ok(_) => Ok(true),
            Err(e) if e.is_absent_device() => {
                log::debug!("nothing at 0x{:02x}: {}", address, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl<T: I2cTransport + ?Sized> I2cTransport for Box<T> {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        (**self).list_devices()
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        (**self).init(device, settings)
    }

    fn deinit(&mut self) -> Result<()> {
        (**self).deinit()
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        (**self).write(address, data)
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        (**self).read(address, count)
    }

    fn max_read(&self) -> usize {
        (**self).max_read()
    }

    fn max_write(&self) -> usize {
        (**self).max_write()
    }

    fn detect(&mut self, address: u8) -> Result<bool> {
        (**self).detect(address)
    }
}

/// Backend options given as `key=value,key=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    params: HashMap<String, String>,
}

impl Settings {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let mut params = HashMap::new();
        for opt in raw.unwrap_or("").split(',').map(str::trim) {
            if opt.is_empty() {
                continue;
            }
            let Some((key, value)) = opt.split_once('=') else {
                return Err(Error::InvalidSettings(format!(
                    "'{}' (expected key=value)",
                    opt
                )));
            };
            params.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
        Ok(Settings { params })
    }

    /// Remove and parse `key`, `None` if absent.
    pub fn take<T: FromStr>(&mut self, key: &str) -> Result<Option<T>> {
        match self.params.remove(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| {
                Error::InvalidSettings(format!("bad value '{}' for '{}'", value, key))
            }),
        }
    }

    /// Fails on keys nobody took.
    pub fn finish(self) -> Result<()> {
        let mut unknown: Vec<_> = self.params.into_keys().collect();
        if unknown.is_empty() {
            return Ok(());
        }
        unknown.sort();
        Err(Error::InvalidSettings(format!(
            "unknown option(s): {}",
            unknown.join(", ")
        )))
    }
}

/// Registry entry describing a backend.
pub struct TransportInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub help: &'static str,
    /// `std::env::consts::OS` values, empty for any.
    pub systems: &'static [&'static str],
    /// `std::env::consts::ARCH` values, empty for any.
    pub architectures: &'static [&'static str],
    open: fn() -> Result<Box<dyn I2cTransport>>,
}

impl TransportInfo {
    pub fn is_supported(&self) -> bool {
        self.supports(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn supports(&self, os: &str, arch: &str) -> bool {
        (self.systems.is_empty() || self.systems.contains(&os))
            && (self.architectures.is_empty() || self.architectures.contains(&arch))
    }

    pub fn open(&self) -> Result<Box<dyn I2cTransport>> {
        if !self.is_supported() {
            return Err(Error::UnsupportedPlatform {
                name: self.name,
                os: std::env::consts::OS,
                arch: std::env::consts::ARCH,
            });
        }
        (self.open)()
    }
}

#[allow(unused_mut)]
pub fn registry() -> Vec<TransportInfo> {
    let mut transports = vec![
        TransportInfo {
            name: "emulator",
            description: "In-memory RTD2662 emulator, nothing is sent to hardware",
            help: emulator::HELP,
            systems: &[],
            architectures: &[],
            open: || Ok(Box::new(Emulator::default())),
        },
        TransportInfo {
            name: "uart_bitbang",
            description: "Bit-banged I2C over USB-serial modem control lines",
            help: serial::HELP,
            systems: &[],
            architectures: &[],
            open: || Ok(Box::new(serial::SerialBitbang::new())),
        },
        TransportInfo {
            name: "mcp2221",
            description: "Microchip MCP2221 USB-I2C bridge (04d8:00dd) via libusb",
            help: mcp2221::HELP,
            systems: &[],
            architectures: &[],
            open: || Ok(Box::new(mcp2221::Mcp2221::new()?)),
        },
        TransportInfo {
            name: "ch341",
            description: "WCH CH341 USB-I2C bridge through the vendor DLL",
            help: ch341::HELP,
            systems: &["windows"],
            architectures: &["x86", "x86_64"],
            open: || Ok(Box::new(ch341::Ch341::load()?)),
        },
        TransportInfo {
            name: "lpt",
            description: "Bit-banged I2C on a parallel port through the inpout DLL",
            help: lpt::HELP,
            systems: &["windows"],
            architectures: &["x86", "x86_64"],
            open: || Ok(Box::new(lpt::Lpt::load()?)),
        },
    ];
    #[cfg(target_os = "linux")]
    transports.push(TransportInfo {
        name: "i2cdev",
        description: "Linux /dev/i2c-N device nodes (GPU DDC, SMBus adapters, ...)",
        help: i2cdev::HELP,
        systems: &["linux"],
        architectures: &[],
        open: || Ok(Box::new(i2cdev::I2cDev::default())),
    });
    transports
}

/// Backends usable on this machine.
pub fn available() -> Vec<TransportInfo> {
    registry().into_iter().filter(|t| t.is_supported()).collect()
}

pub fn open(name: &str) -> Result<Box<dyn I2cTransport>> {
    registry()
        .into_iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownTransport(name.to_string()))?
        .open()
}

/// A device of a backend and whether the controller answered on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub id: u32,
    pub name: String,
    pub detected: bool,
}

/// Probe every device of `transport` for the controller.
pub fn scan<T: I2cTransport + ?Sized>(
    transport: &mut T,
    settings: Option<&str>,
) -> Result<Vec<ScannedDevice>> {
    let devices = transport.list_devices()?;
    let mut found = Vec::with_capacity(devices.len());
    for (id, name) in devices {
        let detected = match transport.init(id, settings) {
            Ok(()) => {
                let detected = transport.detect(ISP_ADDRESS);
                if let Err(e) = transport.deinit() {
                    log::warn!("deinit of device {} failed: {}", id, e);
                }
                detected?
            }
            Err(e) if e.is_absent_device() => {
                log::debug!("device {} ({}) unusable: {}", id, name.trim(), e);
                false
            }
            Err(e) => return Err(e),
        };
        found.push(ScannedDevice {
            id,
            name: name.trim().to_string(),
            detected,
        });
    }
    Ok(found)
}

//! Bit-banged I2C over the modem control lines of a serial port.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serialport::{FlowControl, SerialPort, SerialPortType};

use super::software_i2c::{HALF_PERIOD, Line, LineDriver, SoftwareI2c};
use super::{I2cTransport, Settings};
use crate::error::{Error, Result};

const SERIAL_TIMEOUT_MS: u64 = 1000;

pub const HELP: &str = "Drives SDA/SCL through the handshake lines of a USB-serial adapter.
Outputs need an open-drain stage (diode or transistor) towards the bus.
OPTIONS (-s key=value,...):
  sda_out=dtr|rts        default dtr
  scl_out=dtr|rts        default rts
  sda_in=cts|dsr|ri|cd   default dsr
  scl_in=cts|dsr|ri|cd   default cts
  invert=true|false      lines are active high instead of active low
  half_period_us=<n>     settle time per transition (default 5)";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputPin {
    Dtr,
    Rts,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InputPin {
    Cts,
    Dsr,
    Ri,
    Cd,
}

impl FromStr for OutputPin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dtr" => Ok(OutputPin::Dtr),
            "rts" => Ok(OutputPin::Rts),
            other => Err(format!("'{}' is not an output line", other)),
        }
    }
}

impl FromStr for InputPin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cts" => Ok(InputPin::Cts),
            "dsr" => Ok(InputPin::Dsr),
            "ri" => Ok(InputPin::Ri),
            "cd" | "dcd" => Ok(InputPin::Cd),
            other => Err(format!("'{}' is not an input line", other)),
        }
    }
}

impl Display for OutputPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputPin::Dtr => write!(f, "DTR"),
            OutputPin::Rts => write!(f, "RTS"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PinMap {
    pub sda_out: OutputPin,
    pub scl_out: OutputPin,
    pub sda_in: InputPin,
    pub scl_in: InputPin,
    /// Asserted lines are high instead of low.
    pub invert: bool,
}

impl Default for PinMap {
    fn default() -> Self {
        PinMap {
            sda_out: OutputPin::Dtr,
            scl_out: OutputPin::Rts,
            sda_in: InputPin::Dsr,
            scl_in: InputPin::Cts,
            invert: false,
        }
    }
}

impl PinMap {
    fn from_settings(settings: &mut Settings) -> Result<Self> {
        let mut map = PinMap::default();
        if let Some(pin) = settings.take("sda_out")? {
            map.sda_out = pin;
        }
        if let Some(pin) = settings.take("scl_out")? {
            map.scl_out = pin;
        }
        if let Some(pin) = settings.take("sda_in")? {
            map.sda_in = pin;
        }
        if let Some(pin) = settings.take("scl_in")? {
            map.scl_in = pin;
        }
        if let Some(invert) = settings.take("invert")? {
            map.invert = invert;
        }
        if map.sda_out == map.scl_out {
            return Err(Error::InvalidSettings(format!(
                "SDA and SCL both mapped to {}",
                map.sda_out
            )));
        }
        Ok(map)
    }

    fn output(&self, line: Line) -> OutputPin {
        match line {
            Line::Sda => self.sda_out,
            Line::Scl => self.scl_out,
        }
    }

    fn input(&self, line: Line) -> InputPin {
        match line {
            Line::Sda => self.sda_in,
            Line::Scl => self.scl_in,
        }
    }
}

pub struct ModemLines {
    serial_port: Box<dyn SerialPort>,
    map: PinMap,
}

impl ModemLines {
    fn set(&mut self, pin: OutputPin, asserted: bool) -> Result<()> {
        match pin {
            OutputPin::Dtr => self.serial_port.write_data_terminal_ready(asserted)?,
            OutputPin::Rts => self.serial_port.write_request_to_send(asserted)?,
        }
        Ok(())
    }

    fn get(&mut self, pin: InputPin) -> Result<bool> {
        Ok(match pin {
            InputPin::Cts => self.serial_port.read_clear_to_send()?,
            InputPin::Dsr => self.serial_port.read_data_set_ready()?,
            InputPin::Ri => self.serial_port.read_ring_indicator()?,
            InputPin::Cd => self.serial_port.read_carrier_detect()?,
        })
    }
}

impl LineDriver for ModemLines {
    fn drive_low(&mut self, line: Line) -> Result<()> {
        self.set(self.map.output(line), !self.map.invert)
    }

    fn release(&mut self, line: Line) -> Result<bool> {
        self.set(self.map.output(line), self.map.invert)?;
        let asserted = self.get(self.map.input(line))?;
        Ok(asserted == self.map.invert)
    }
}

#[derive(Default)]
pub struct SerialBitbang {
    bus: Option<SoftwareI2c<ModemLines>>,
}

impl SerialBitbang {
    pub fn new() -> Self {
        SerialBitbang { bus: None }
    }

    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn bus(&mut self) -> Result<&mut SoftwareI2c<ModemLines>> {
        self.bus.as_mut().ok_or(Error::NotInitialized)
    }
}

impl I2cTransport for SerialBitbang {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .enumerate()
            .map(|(i, port)| {
                let name = match port.port_type {
                    SerialPortType::UsbPort(info) => format!(
                        "{} ({:04x}:{:04x} {})",
                        port.port_name,
                        info.vid,
                        info.pid,
                        info.product.unwrap_or_default()
                    ),
                    _ => port.port_name,
                };
                (i as u32, name)
            })
            .collect())
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        let ports = Self::scan_ports()?;
        let port = ports
            .get(device as usize)
            .ok_or(Error::DeviceNotFound(device))?;

        let mut settings = Settings::parse(settings)?;
        let map = PinMap::from_settings(&mut settings)?;
        let half_period = settings
            .take::<u64>("half_period_us")?
            .map(Duration::from_micros)
            .unwrap_or(HALF_PERIOD);
        settings.finish()?;

        log::info!(
            "Opening serial port: \"{}\" (SDA {}/{:?}, SCL {}/{:?})",
            port,
            map.sda_out,
            map.sda_in,
            map.scl_out,
            map.scl_in
        );
        let serial_port = serialport::new(port, 9600)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .flow_control(FlowControl::None)
            .open()?;

        let mut bus = SoftwareI2c::new(ModemLines { serial_port, map }).with_half_period(half_period);
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
    fn pin_map_defaults() {
        let mut settings = Settings::parse(None).unwrap();
        let map = PinMap::from_settings(&mut settings).unwrap();
        assert_eq!(map, PinMap::default());
        assert_eq!(map.output(Line::Scl), OutputPin::Rts);
        assert_eq!(map.input(Line::Sda), InputPin::Dsr);
    }

    #[test]
    fn pin_map_from_settings() {
        let mut settings =
            Settings::parse(Some("sda_out=RTS,scl_out=dtr,sda_in=cd,invert=true")).unwrap();
        let map = PinMap::from_settings(&mut settings).unwrap();
        assert_eq!(map.sda_out, OutputPin::Rts);
        assert_eq!(map.scl_out, OutputPin::Dtr);
        assert_eq!(map.sda_in, InputPin::Cd);
        assert!(map.invert);
        settings.finish().unwrap();
    }

    #[test]
    fn pin_map_rejects_shared_output() {
        let mut settings = Settings::parse(Some("sda_out=rts")).unwrap();
        assert!(PinMap::from_settings(&mut settings).is_err());
        let mut settings = Settings::parse(Some("scl_in=rts")).unwrap();
        assert!(PinMap::from_settings(&mut settings).is_err());
    }

    #[test]
    fn uninitialized_transfer_fails() {
        let mut transport = SerialBitbang::new();
        assert!(matches!(
            transport.write(0x4A, &[0x6F]),
            Err(Error::NotInitialized)
        ));
    }
}

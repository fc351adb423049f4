//! Microchip MCP2221 USB-I2C bridge, driven through libusb instead of the HID stack.
use std::collections::BTreeMap;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use super::{I2cTransport, Settings};
use crate::error::{Error, Result};
use crate::poll::Poll;

pub const HELP: &str = "Microchip MCP2221/MCP2221A USB to I2C bridge (04d8:00dd).
The HID interface is claimed directly, detaching the kernel driver on Linux.
On Windows install a libusb compatible driver (WinUSB, libusbK) for interface 2.
OPTIONS (-s key=value,...):
  speed=<hz>   bus clock, default 400000";

const MCP2221_VID: u16 = 0x04D8;
const MCP2221_PID: u16 = 0x00DD;

const HID_INTERFACE: u8 = 2;
const REPORT_SIZE: usize = 64;
/// Payload bytes that fit a single report.
const MAX_TRANSFER: usize = 60;

const DEFAULT_SPEED: u32 = 400_000;
const CLOCK: u32 = 12_000_000;

const TIMEOUT: Duration = Duration::from_millis(1000);
const READY_TIMEOUT: Duration = Duration::from_secs(2);

mod command {
    pub const STATUS: u8 = 0x10;
    pub const WRITE: u8 = 0x90;
    pub const READ: u8 = 0x91;
    pub const GET_DATA: u8 = 0x40;
}

mod sub_command {
    pub const CANCEL: u8 = 0x10;
    pub const SET_SPEED: u8 = 0x20;
}

/// I2C engine states reported at offset 8 of a status response.
mod engine {
    pub const IDLE: u8 = 0x00;
    pub const READ_COMPLETE: u8 = 0x55;
    pub const ADDRESS_NACK: u8 = 0x25;
}

pub struct Mcp2221 {
    context: Context,
    open: Option<Opened>,
}

struct Opened {
    handle: DeviceHandle<Context>,
    endpoint_in: u8,
    endpoint_out: u8,
    address: u8,
}

impl Mcp2221 {
    pub fn new() -> Result<Self> {
        Ok(Mcp2221 {
            context: Context::new()?,
            open: None,
        })
    }

    fn devices(&self) -> Result<Vec<Device<Context>>> {
        let mut devices: Vec<_> = self
            .context
            .devices()?
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == MCP2221_VID && desc.product_id() == MCP2221_PID)
                    .unwrap_or(false)
            })
            .collect();
        devices.sort_by_key(|d| (d.bus_number(), d.address()));
        Ok(devices)
    }

    fn opened(&mut self) -> Result<&mut Opened> {
        self.open.as_mut().ok_or(Error::NotInitialized)
    }
}

impl Opened {
    fn open(device: &Device<Context>) -> Result<Self> {
        let mut handle = device.open()?;

        #[cfg(not(target_os = "windows"))]
        if handle.kernel_driver_active(HID_INTERFACE).unwrap_or(false) {
            log::debug!("Detaching kernel driver from interface {}", HID_INTERFACE);
            handle.detach_kernel_driver(HID_INTERFACE).map_err(|e| {
                Error::Transport(format!("failed to detach HID kernel driver: {}", e))
            })?;
        }
        handle.claim_interface(HID_INTERFACE)?;

        // interface number is not necessarily its index on Windows
        let config = device.active_config_descriptor()?;
        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for intf in config.interfaces() {
            for desc in intf.descriptors() {
                if desc.interface_number() != HID_INTERFACE {
                    continue;
                }
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Interrupt {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::In => endpoint_in = Some(endpoint.address()),
                        Direction::Out => endpoint_out = Some(endpoint.address()),
                    }
                }
            }
        }
        let (Some(endpoint_in), Some(endpoint_out)) = (endpoint_in, endpoint_out) else {
            return Err(Error::Transport("MCP2221 HID endpoints not found".into()));
        };
        log::debug!(
            "MCP2221 endpoints: in 0x{:02x}, out 0x{:02x}",
            endpoint_in,
            endpoint_out
        );

        Ok(Opened {
            handle,
            endpoint_in,
            endpoint_out,
            address: 0,
        })
    }

    fn exchange(&mut self, request: &[u8]) -> Result<[u8; REPORT_SIZE]> {
        let mut report = [0u8; REPORT_SIZE];
        report[..request.len()].copy_from_slice(request);
        self.handle
            .write_interrupt(self.endpoint_out, &report, TIMEOUT)?;
        let mut response = [0u8; REPORT_SIZE];
        let n = self
            .handle
            .read_interrupt(self.endpoint_in, &mut response, TIMEOUT)?;
        if n < REPORT_SIZE {
            return Err(Error::Transport(format!("short MCP2221 report ({} bytes)", n)));
        }
        Ok(response)
    }

    fn status(&mut self, cancel: u8, speed: u8, divider: u8) -> Result<[u8; REPORT_SIZE]> {
        self.exchange(&[command::STATUS, 0x00, cancel, speed, divider])
    }

    fn cancel_transfer(&mut self) -> Result<()> {
        self.status(sub_command::CANCEL, 0, 0)?;
        Poll::new(READY_TIMEOUT, Duration::ZERO)
            .wait_stuck("MCP2221 cancel", || Ok(self.status(0, 0, 0)?[2] != sub_command::CANCEL))
    }

    fn wait_ready(&mut self) -> Result<()> {
        let mut state = engine::IDLE;
        let settled = Poll::new(READY_TIMEOUT, Duration::ZERO).wait(
            || {
                state = self.status(0, 0, 0)?[8];
                Ok(matches!(
                    state,
                    engine::IDLE | engine::READ_COMPLETE | engine::ADDRESS_NACK
                ))
            },
            || Error::BusStuck {
                what: "MCP2221 I2C engine",
                timeout_ms: READY_TIMEOUT.as_millis(),
            },
        );
        if settled.is_err() {
            log::debug!("MCP2221 I2C engine stuck in state 0x{:02x}", state);
        }
        settled?;
        if state == engine::ADDRESS_NACK {
            self.cancel_transfer()?;
            return Err(Error::NoAck {
                address: self.address,
            });
        }
        Ok(())
    }
}

impl I2cTransport for Mcp2221 {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        Ok(self
            .devices()?
            .iter()
            .enumerate()
            .map(|(i, dev)| {
                (
                    i as u32,
                    format!("MCP2221 on bus {} device {}", dev.bus_number(), dev.address()),
                )
            })
            .collect())
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        let mut settings = Settings::parse(settings)?;
        let speed = settings.take::<u32>("speed")?.unwrap_or(DEFAULT_SPEED);
        settings.finish()?;
        let divider = (CLOCK / speed.max(1))
            .checked_sub(3)
            .and_then(|d| u8::try_from(d).ok())
            .ok_or_else(|| Error::InvalidSettings(format!("unsupported speed {} Hz", speed)))?;

        let devices = self.devices()?;
        let usb_device = devices
            .get(device as usize)
            .ok_or(Error::DeviceNotFound(device))?;
        log::debug!("Found USB Device {:?}", usb_device);

        let mut opened = Opened::open(usb_device)?;
        opened.cancel_transfer()?;
        let response = opened.status(0, sub_command::SET_SPEED, divider)?;
        if response[22] == 0 {
            return Err(Error::BusStuck {
                what: "SCL",
                timeout_ms: 0,
            });
        }
        if response[23] == 0 {
            return Err(Error::BusStuck {
                what: "SDA",
                timeout_ms: 0,
            });
        }
        log::info!("MCP2221 bus clock {} Hz (divider {})", speed, divider);
        self.open = Some(opened);
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(mut opened) = self.open.take() {
            opened.handle.release_interface(HID_INTERFACE)?;
        }
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        if data.len() > MAX_TRANSFER {
            return Err(Error::Transport(format!(
                "write of {} bytes exceeds the {} byte report",
                data.len(),
                MAX_TRANSFER
            )));
        }
        let opened = self.opened()?;
        opened.address = address;
        let len = data.len() as u16;
        let mut request = vec![command::WRITE, len as u8, (len >> 8) as u8, address << 1];
        request.extend_from_slice(data);

        opened.wait_ready()?;
        if opened.exchange(&request)?[1] != 0 {
            return Err(Error::Transport("MCP2221 I2C engine is busy".into()));
        }
        opened.wait_ready()
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        if count > MAX_TRANSFER {
            return Err(Error::Transport(format!(
                "read of {} bytes exceeds the {} byte report",
                count, MAX_TRANSFER
            )));
        }
        let opened = self.opened()?;
        opened.address = address;
        let len = count as u16;

        opened.wait_ready()?;
        let request = [command::READ, len as u8, (len >> 8) as u8, address << 1 | 1];
        if opened.exchange(&request)?[1] != 0 {
            return Err(Error::Transport("MCP2221 I2C engine is busy".into()));
        }
        opened.wait_ready()?;
        let response = opened.exchange(&[command::GET_DATA])?;
        if response[1] != 0 {
            return Err(Error::Transport(
                "MCP2221 failed to hand over the read data".into(),
            ));
        }
        let n = (response[3] as usize).min(MAX_TRANSFER);
        if n < count {
            return Err(Error::Transport(format!(
                "MCP2221 returned {} of {} bytes",
                n, count
            )));
        }
        Ok(response[4..4 + count].to_vec())
    }

    fn max_read(&self) -> usize {
        MAX_TRANSFER
    }

    fn max_write(&self) -> usize {
        MAX_TRANSFER
    }
}

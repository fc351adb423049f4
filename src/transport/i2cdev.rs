//! Linux i2c-dev backend: any adapter the kernel exposes as `/dev/i2c-N`,
//! including the DDC channels of most GPU drivers.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;

use super::{I2cTransport, Settings};
use crate::error::{Error, Result};

pub const HELP: &str = "Linux i2c-dev device nodes (/dev/i2c-N).
Load the i2c-dev module and make sure the user can open the node.
VGA/DVI/HDMI DDC lines of a GPU usually show up here as well.
No options.";

const SYSFS_DEVICES: &str = "/sys/bus/i2c/devices";

mod ioctl {
    use nix::ioctl_write_int_bad;

    const I2C_SLAVE: u16 = 0x0703;

    ioctl_write_int_bad!(i2c_slave, I2C_SLAVE);
}

#[derive(Default)]
pub struct I2cDev {
    file: Option<File>,
    slave: Option<u8>,
}

impl I2cDev {
    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::NotInitialized)
    }

    fn select(&mut self, address: u8) -> Result<()> {
        if self.slave == Some(address) {
            return Ok(());
        }
        let fd = self.file()?.as_raw_fd();
        // SAFETY: fd is an open i2c-dev node owned by self.file
        unsafe { ioctl::i2c_slave(fd, address as i32) }.map_err(|e| {
            Error::Transport(format!("failed to select slave 0x{:02x}: {}", address, e))
        })?;
        self.slave = Some(address);
        Ok(())
    }
}

/// Parse the bus number out of a sysfs entry name like `i2c-3`.
fn bus_number(entry: &str) -> Option<u32> {
    entry.strip_prefix("i2c-")?.parse().ok()
}

fn is_nack(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENXIO | Errno::EREMOTEIO | Errno::EIO)
    )
}

impl I2cTransport for I2cDev {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        let mut devices = BTreeMap::new();
        for entry in fs::read_dir(SYSFS_DEVICES)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(bus) = file_name.to_str().and_then(bus_number) else {
                continue;
            };
            let name = fs::read_to_string(entry.path().join("name"))
                .map(|n| n.trim().to_string())
                .unwrap_or_default();
            devices.insert(bus, name);
        }
        Ok(devices)
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        Settings::parse(settings)?.finish()?;
        let path = format!("/dev/i2c-{}", device);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::DeviceNotFound(device),
                _ => Error::Io(e),
            })?;
        log::debug!("Opened {}", path);
        self.file = Some(file);
        self.slave = None;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.file = None;
        self.slave = None;
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        self.select(address)?;
        self.file()?.write_all(data).map_err(|e| {
            if is_nack(&e) {
                Error::NoAck { address }
            } else {
                Error::Io(e)
            }
        })
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        self.select(address)?;
        let mut data = vec![0u8; count];
        self.file()?.read_exact(&mut data).map_err(|e| {
            if is_nack(&e) {
                Error::NoAck { address }
            } else {
                Error::Io(e)
            }
        })?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_names() {
        assert_eq!(bus_number("i2c-0"), Some(0));
        assert_eq!(bus_number("i2c-12"), Some(12));
        assert_eq!(bus_number("0-0050"), None);
        assert_eq!(bus_number("i2c-dev"), None);
    }

    #[test]
    fn nack_errnos() {
        assert!(is_nack(&io::Error::from_raw_os_error(Errno::ENXIO as i32)));
        assert!(is_nack(&io::Error::from_raw_os_error(Errno::EREMOTEIO as i32)));
        assert!(!is_nack(&io::Error::from_raw_os_error(Errno::EACCES as i32)));
    }

    #[test]
    fn missing_node_is_device_not_found() {
        let mut dev = I2cDev::default();
        assert!(matches!(dev.init(9999, None), Err(Error::DeviceNotFound(9999))));
        assert!(matches!(dev.read(0x4A, 1), Err(Error::NotInitialized)));
    }
}

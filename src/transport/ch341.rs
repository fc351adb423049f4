//! WCH CH341A in I2C mode through the vendor DLL.
use std::collections::BTreeMap;
use std::ffi::c_void;

use libloading::Library;

use super::{I2cTransport, Settings};
use crate::error::{Error, Result};

pub const HELP: &str = "WCH CH341A USB bridge in I2C mode.
Needs the vendor driver and CH341DLL.DLL (CH341DLLA64.DLL on 64 bit) in PATH.
OPTIONS (-s key=value,...):
  speed=0|1|2|3   0 = 20 kHz, 1 = 100 kHz (default), 2 = 400 kHz, 3 = 750 kHz";

#[cfg(target_pointer_width = "64")]
const DLL_NAME: &str = "CH341DLLA64.DLL";
#[cfg(not(target_pointer_width = "64"))]
const DLL_NAME: &str = "CH341DLL.DLL";

/// Device indices probed by `list_devices`.
const MAX_DEVICES: u32 = 16;
const INVALID_HANDLE: isize = -1;
const DEFAULT_SPEED: u32 = 1;

type OpenDevice = unsafe extern "system" fn(index: u32) -> isize;
type CloseDevice = unsafe extern "system" fn(index: u32);
type SetStream = unsafe extern "system" fn(index: u32, mode: u32) -> i32;
type StreamI2c = unsafe extern "system" fn(
    index: u32,
    write_len: u32,
    write_buf: *const c_void,
    read_len: u32,
    read_buf: *mut c_void,
) -> i32;

pub struct Ch341 {
    open_device: OpenDevice,
    close_device: CloseDevice,
    set_stream: SetStream,
    stream_i2c: StreamI2c,
    index: Option<u32>,
    // keeps the function pointers above valid
    _library: Library,
}

impl Ch341 {
    pub fn load() -> Result<Self> {
        log::debug!("Loading {}", DLL_NAME);
        // SAFETY: the vendor DLL has no initialisation side effects beyond DllMain
        unsafe {
            let library = Library::new(DLL_NAME)?;
            let open_device = *library.get::<OpenDevice>(b"CH341OpenDevice\0")?;
            let close_device = *library.get::<CloseDevice>(b"CH341CloseDevice\0")?;
            let set_stream = *library.get::<SetStream>(b"CH341SetStream\0")?;
            let stream_i2c = *library.get::<StreamI2c>(b"CH341StreamI2C\0")?;
            Ok(Ch341 {
                open_device,
                close_device,
                set_stream,
                stream_i2c,
                index: None,
                _library: library,
            })
        }
    }

    fn index(&self) -> Result<u32> {
        self.index.ok_or(Error::NotInitialized)
    }

    fn stream(&mut self, write: &[u8], read: &mut [u8]) -> Result<bool> {
        let index = self.index()?;
        // SAFETY: both buffers outlive the call and their lengths are passed along
        let ok = unsafe {
            (self.stream_i2c)(
                index,
                write.len() as u32,
                write.as_ptr() as *const c_void,
                read.len() as u32,
                read.as_mut_ptr() as *mut c_void,
            )
        };
        Ok(ok != 0)
    }
}

impl I2cTransport for Ch341 {
    fn list_devices(&mut self) -> Result<BTreeMap<u32, String>> {
        let mut devices = BTreeMap::new();
        for index in 0..MAX_DEVICES {
            if self.index == Some(index) {
                devices.insert(index, format!("CH341 #{}", index));
                continue;
            }
            // SAFETY: plain integer arguments
            let handle = unsafe { (self.open_device)(index) };
            if handle != INVALID_HANDLE {
                unsafe { (self.close_device)(index) };
                devices.insert(index, format!("CH341 #{}", index));
            }
        }
        Ok(devices)
    }

    fn init(&mut self, device: u32, settings: Option<&str>) -> Result<()> {
        let mut settings = Settings::parse(settings)?;
        let speed = settings.take::<u32>("speed")?.unwrap_or(DEFAULT_SPEED);
        settings.finish()?;
        if speed > 3 {
            return Err(Error::InvalidSettings(format!(
                "speed must be 0..=3, got {}",
                speed
            )));
        }

        // SAFETY: plain integer arguments
        if unsafe { (self.open_device)(device) } == INVALID_HANDLE {
            return Err(Error::DeviceNotFound(device));
        }
        self.index = Some(device);
        if unsafe { (self.set_stream)(device, speed) } == 0 {
            return Err(Error::Transport(format!(
                "CH341SetStream({}) failed",
                speed
            )));
        }
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(index) = self.index.take() {
            // SAFETY: index was opened by init
            unsafe { (self.close_device)(index) };
        }
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(address << 1);
        frame.extend_from_slice(data);
        if !self.stream(&frame, &mut [])? {
            return Err(Error::Transport("CH341StreamI2C write failed".into()));
        }
        Ok(())
    }

    fn read(&mut self, address: u8, count: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; count];
        if !self.stream(&[address << 1 | 1], &mut data)? {
            return Err(Error::Transport("CH341StreamI2C read failed".into()));
        }
        Ok(data)
    }

    /// The DLL does not report address NACKs; an idle bus reads back as 0xFF.
    fn detect(&mut self, address: u8) -> Result<bool> {
        let mut byte = [0u8; 1];
        if !self.stream(&[address << 1 | 1], &mut byte)? {
            return Ok(false);
        }
        Ok(byte[0] != 0xFF)
    }
}

impl Drop for Ch341 {
    fn drop(&mut self) {
        let _ = self.deinit();
    }
}

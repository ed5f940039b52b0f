//! CLI command implementations
//!
//! Commands that talk to a device are generic over
//! [`rdfu_core::DfuDevice`], so the same code drives real USB devices and
//! the in-memory dummy used by the tests.

pub mod list;
pub mod read;
pub mod reboot;
pub mod uf2;
pub mod write;

use rdfu_core::DeviceFilter;
use rdfu_usb::UsbDfuDevice;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised by the commands themselves
#[derive(Debug, Error)]
pub enum CommandError {
    /// No start address given and the device has no memory layout
    #[error("no start address given and the device advertises no memory")]
    NoStartAddress,

    /// No length given and the start address is outside known memory
    #[error("cannot tell how much to read at 0x{0:08X}, use --length")]
    UnknownLength(u32),

    /// The input is not a UF2 file
    #[error("not a UF2 file")]
    NotUf2,
}

/// Pick the single device in `devices`
pub fn select_device<D>(devices: Vec<D>) -> Result<D, rdfu_core::Error> {
    let count = devices.len();
    let mut devices = devices.into_iter();
    match (devices.next(), count) {
        (Some(device), 1) => Ok(device),
        (None, _) => Err(rdfu_core::Error::NoDeviceFound),
        _ => Err(rdfu_core::Error::MultipleDevices(count)),
    }
}

/// Open the only USB DFU device matching `filter`
pub fn open_device(filter: &DeviceFilter) -> Result<UsbDfuDevice, Box<dyn std::error::Error>> {
    let device = select_device(rdfu_usb::find_devices(filter)?)?;
    let info = rdfu_core::DfuDevice::info(&device);
    log::info!(
        "Using {:04x}:{:04x} {} on bus {} device {:03}",
        info.vendor_id,
        info.product_id,
        info.product_string,
        info.bus_id,
        info.device_address
    );
    Ok(device)
}

/// Read file contents into a Vec
pub fn read_file(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let data = fs::read(path)?;
    println!("Read {} bytes from {:?}", data.len(), path);
    Ok(data)
}

//! Read command implementation

use rdfu_core::progress::FlashProgress;
use rdfu_core::read::read_memory;
use rdfu_core::{DeviceInfo, DfuUpload};

use super::CommandError;

/// Bytes from `start` to the end of the memory holding it
fn default_length(info: &DeviceInfo, start: u32) -> Option<usize> {
    info.interfaces
        .iter()
        .find_map(|intf| intf.layout.span_from(start))
        .and_then(|len| usize::try_from(len).ok())
}

/// Read `length` bytes at `start` from `device`
///
/// `start` defaults to the device's first memory, `length` to the end of
/// the memory containing `start`.
pub fn run<D: DfuUpload>(
    device: &mut D,
    start: Option<u32>,
    length: Option<u32>,
    progress: &mut dyn FlashProgress,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let start = start
        .or_else(|| device.default_start_address())
        .ok_or(CommandError::NoStartAddress)?;
    let length = match length {
        Some(len) => len as usize,
        None => default_length(device.info(), start).ok_or(CommandError::UnknownLength(start))?,
    };
    log::info!("Reading {} bytes at 0x{:08X}", length, start);
    Ok(read_memory(device, start, length, progress)?)
}

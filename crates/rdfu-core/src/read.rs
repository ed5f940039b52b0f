//! Reading device memory back

use crate::device::DfuUpload;
use crate::error::{Error, Result};
use crate::plan::spans;
use crate::progress::FlashProgress;

/// Read `length` bytes starting at `start`
///
/// A block shorter than requested means the device ran out of readable
/// memory and fails the read.
pub fn read_memory<D: DfuUpload>(
    device: &mut D,
    start: u32,
    length: usize,
    progress: &mut dyn FlashProgress,
) -> Result<Vec<u8>> {
    let block_size = device
        .start_upload(start, length)
        .map_err(Error::device("start upload"))?;
    log::debug!("Upload 0x{:08X} + {} bytes, block size {}", start, length, block_size);

    let mut data = Vec::with_capacity(length);
    progress.reading(start, length);
    for (address, len) in spans(start, length, block_size as usize)? {
        let block = device.upload(address, len).map_err(|e| Error::TransferFailure {
            address,
            source: Box::new(e),
        })?;
        if block.len() < len {
            return Err(Error::TransferFailure {
                address,
                source: format!("short read: {} of {} bytes", block.len(), len).into(),
            });
        }
        data.extend_from_slice(&block[..len]);
        progress.read_progress(data.len(), length);
    }

    Ok(data)
}

//! Erase-then-program of a single address range

use crate::device::DfuDevice;
use crate::error::{Error, Result};
use crate::image::AddressRange;
use crate::plan::chunk;
use crate::progress::FlashProgress;

/// Flashes one address range on one device
///
/// All pages are erased before the first transfer. The first failing
/// request aborts the session; nothing is retried.
pub struct FlashSession<'r, 'a> {
    range: &'r AddressRange<'a>,
    bytes_done: usize,
}

impl<'r, 'a> FlashSession<'r, 'a> {
    /// Create a session for `range`
    pub fn new(range: &'r AddressRange<'a>) -> Self {
        Self {
            range,
            bytes_done: 0,
        }
    }

    /// Bytes downloaded so far
    pub fn bytes_done(&self) -> usize {
        self.bytes_done
    }

    /// Run the session to completion
    pub fn run<D: DfuDevice>(
        &mut self,
        device: &mut D,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let range = self.range;
        let start = range.start_address;
        let Some(end) = range.end_address() else {
            log::debug!("Skipping empty range at 0x{:08X}", start);
            return Ok(());
        };
        let total = range.len();

        let ctx = device
            .start_download(start, end)
            .map_err(Error::device("start download"))?;
        log::debug!(
            "Download 0x{:08X}..=0x{:08X}: transfer size {}, {} erase region(s)",
            start,
            end,
            ctx.max_transfer_size,
            ctx.regions.len()
        );

        // Plan everything up front so bad geometry fails before the first erase
        let pages = ctx.plan_erase(start, end)?;
        let chunks = chunk(&range.payload, start, ctx.max_transfer_size as usize)?;

        log::info!("Erasing {} page(s) at 0x{:08X}", pages.len(), start);
        progress.erasing(start, pages.len());
        for (i, page) in pages.iter().enumerate() {
            log::trace!("Erase page 0x{:08X}", page.address);
            device
                .erase_page(page.address)
                .map_err(|e| Error::EraseFailure {
                    address: page.address,
                    source: Box::new(e),
                })?;
            progress.erase_progress(i + 1, pages.len());
        }

        log::info!("Writing {} bytes at 0x{:08X}", total, start);
        progress.downloading(start, total);
        for transfer in chunks {
            log::trace!(
                "Download {} bytes at 0x{:08X}",
                transfer.data.len(),
                transfer.address
            );
            device
                .download(transfer.address, transfer.data)
                .map_err(|e| Error::TransferFailure {
                    address: transfer.address,
                    source: Box::new(e),
                })?;
            self.bytes_done += transfer.data.len();
            progress.download_progress(self.bytes_done, total);
        }

        Ok(())
    }
}

/// Erase and program `range` on `device`
pub fn flash_range<D: DfuDevice>(
    device: &mut D,
    range: &AddressRange<'_>,
    progress: &mut dyn FlashProgress,
) -> Result<()> {
    FlashSession::new(range).run(device, progress)
}

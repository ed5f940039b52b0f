//! Erase planning and transfer chunking
//!
//! Flash must be erased page by page before it can be programmed, and the
//! device only accepts downloads up to its transfer size. These helpers turn
//! an address window into the exact pages to erase and a payload into the
//! exact chunks to send.

use std::slice;

use crate::error::{Error, Result};

/// A page to erase, identified by its first address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ErasePage {
    /// Address of the first byte of the page
    pub address: u32,
}

/// Compute the pages covering `[start, end]` (both inclusive)
///
/// Pages are numbered from address 0: the result is every page from
/// `start / page_size` to `end / page_size`, ascending. Aligned windows get
/// no extra page on either side.
pub fn plan_erase(start: u32, end: u32, page_size: u32, page_count: u32) -> Result<Vec<ErasePage>> {
    if page_size == 0 {
        return Err(Error::geometry("page size is zero"));
    }
    if start > end {
        return Err(Error::geometry(format!(
            "erase window 0x{:08X}..=0x{:08X} is inverted",
            start, end
        )));
    }

    let first = start / page_size;
    let last = end / page_size;
    let needed = (last - first) as u64 + 1;
    if needed > page_count as u64 {
        return Err(Error::geometry(format!(
            "window 0x{:08X}..=0x{:08X} needs {} pages of {} bytes, device has {}",
            start, end, needed, page_size, page_count
        )));
    }

    Ok((first..=last)
        .map(|index| ErasePage {
            address: index * page_size,
        })
        .collect())
}

/// A uniformly paged stretch of writable device memory
///
/// Regions that cannot be erased (option bytes, OTP) are programmed
/// directly and plan no pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRegion {
    /// First address of the region
    pub start: u32,
    /// Erase page size in bytes
    pub page_size: u32,
    /// Number of pages in the region
    pub page_count: u32,
    /// Whether pages must be erased before programming
    pub erasable: bool,
}

impl EraseRegion {
    /// Exclusive end of the region
    pub fn end(&self) -> u64 {
        self.start as u64 + self.page_size as u64 * self.page_count as u64
    }

    /// Whether the region overlaps `[start, end]`
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        (start as u64) < self.end() && end >= self.start
    }

    /// Pages of this region touched by `[start, end]`
    ///
    /// The window is clipped to the region and pages are counted from the
    /// region start, which need not be page aligned.
    pub fn plan(&self, start: u32, end: u32) -> Result<Vec<ErasePage>> {
        if self.page_size == 0 {
            return Err(Error::geometry(format!(
                "region at 0x{:08X} has a zero page size",
                self.start
            )));
        }
        if !self.erasable || !self.overlaps(start, end) {
            return Ok(Vec::new());
        }

        let last_in_region = (self.end() - 1).min(u32::MAX as u64) as u32;
        let lo = start.max(self.start) - self.start;
        let hi = end.min(last_in_region) - self.start;

        let pages = plan_erase(lo, hi, self.page_size, self.page_count)?;
        Ok(pages
            .into_iter()
            .map(|page| ErasePage {
                address: self.start + page.address,
            })
            .collect())
    }
}

/// Geometry the device reports when a download starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadContext {
    /// Largest payload accepted by a single download request
    pub max_transfer_size: u16,
    /// Erase regions overlapping the download window, ascending
    pub regions: Vec<EraseRegion>,
}

impl DownloadContext {
    /// Context for a device with a single uniformly paged memory
    pub fn uniform(start: u32, page_size: u32, page_count: u32, max_transfer_size: u16) -> Self {
        Self {
            max_transfer_size,
            regions: vec![EraseRegion {
                start,
                page_size,
                page_count,
                erasable: true,
            }],
        }
    }

    /// Pages to erase for `[start, end]` across all regions
    ///
    /// The regions must cover the whole window without holes. A window in
    /// non-erasable regions only plans no pages.
    pub fn plan_erase(&self, start: u32, end: u32) -> Result<Vec<ErasePage>> {
        if start > end {
            return Err(Error::geometry(format!(
                "erase window 0x{:08X}..=0x{:08X} is inverted",
                start, end
            )));
        }

        let mut regions: Vec<&EraseRegion> = self
            .regions
            .iter()
            .filter(|r| r.overlaps(start, end))
            .collect();
        regions.sort_by_key(|r| r.start);

        let mut covered = start as u64;
        let mut pages = Vec::new();
        for region in regions {
            if region.start as u64 > covered {
                break;
            }
            pages.extend(region.plan(start, end)?);
            covered = covered.max(region.end());
        }

        if covered <= end as u64 {
            return Err(Error::geometry(format!(
                "no writable memory at 0x{:08X} (window 0x{:08X}..=0x{:08X})",
                covered, start, end
            )));
        }

        pages.sort();
        pages.dedup();
        log::debug!(
            "Erase plan for 0x{:08X}..=0x{:08X}: {} pages",
            start,
            end,
            pages.len()
        );
        Ok(pages)
    }
}

/// One download request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferChunk<'a> {
    /// Device address of the first byte
    pub address: u32,
    /// Bytes to send
    pub data: &'a [u8],
}

/// Iterator over the chunks of a payload
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    inner: slice::Chunks<'a, u8>,
    address: u32,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = TransferChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.inner.next()?;
        let chunk = TransferChunk {
            address: self.address,
            data,
        };
        self.address = self.address.wrapping_add(data.len() as u32);
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Split `payload` into transfers of at most `max_transfer_size` bytes
///
/// Every chunk but the last is full sized; addresses advance by each
/// chunk's length starting at `start`.
pub fn chunk(payload: &[u8], start: u32, max_transfer_size: usize) -> Result<Chunks<'_>> {
    if max_transfer_size == 0 {
        return Err(Error::geometry("transfer size is zero"));
    }
    Ok(Chunks {
        inner: payload.chunks(max_transfer_size),
        address: start,
    })
}

/// Split a read of `length` bytes at `start` into `(address, len)` blocks
pub fn spans(
    start: u32,
    length: usize,
    max_transfer_size: usize,
) -> Result<impl Iterator<Item = (u32, usize)>> {
    if max_transfer_size == 0 {
        return Err(Error::geometry("transfer size is zero"));
    }
    let count = length.div_ceil(max_transfer_size);
    Ok((0..count).map(move |i| {
        let offset = i * max_transfer_size;
        let len = max_transfer_size.min(length - offset);
        (start.wrapping_add(offset as u32), len)
    }))
}

//! Firmware image handling
//!
//! A firmware image is either a plain binary, flashed as one range at a
//! known start address, or a UF2 container describing any number of
//! address ranges and reboot markers. Both are exposed through
//! [`RangeSource`] so the flashing code never branches on the format.

pub mod uf2;

#[cfg(any(test, feature = "test-utils"))]
pub mod builder;

use std::borrow::Cow;

use thiserror::Error;

pub use uf2::{is_uf2, Uf2Image};

/// A contiguous span of bytes to place at an absolute device address
///
/// When `reboot_address` is set, the range is a reboot marker: its payload
/// is a trigger written at `start_address` before the device is told to
/// restart at `reboot_address`. The payload of a marker may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange<'a> {
    /// First device address covered by the payload
    pub start_address: u32,
    /// Bytes to write, borrowed from the image whenever possible
    pub payload: Cow<'a, [u8]>,
    /// Address the device should restart at, for reboot markers
    pub reboot_address: Option<u32>,
}

impl<'a> AddressRange<'a> {
    /// Create a plain (non-reboot) range
    pub fn new(start_address: u32, payload: impl Into<Cow<'a, [u8]>>) -> Self {
        Self {
            start_address,
            payload: payload.into(),
            reboot_address: None,
        }
    }

    /// Number of payload bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this range asks the device to reboot
    pub fn is_reboot(&self) -> bool {
        self.reboot_address.is_some()
    }

    /// Last address covered (inclusive), or `None` for an empty payload
    pub fn end_address(&self) -> Option<u32> {
        let len = u32::try_from(self.payload.len()).ok()?;
        if len == 0 {
            return None;
        }
        self.start_address.checked_add(len - 1)
    }

    /// Exclusive end address, widened so that a range ending at the top of
    /// the address space is representable
    pub(crate) fn end_exclusive(&self) -> u64 {
        self.start_address as u64 + self.payload.len() as u64
    }
}

/// Errors detected while decoding a firmware image
///
/// Block indices are zero-based positions in the file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// A plain binary with no content
    #[error("image is empty")]
    Empty,

    /// A plain binary was given but no start address is known
    #[error("no start address known for a plain binary image")]
    NoStartAddress,

    /// A plain binary does not fit in the 32-bit address space at its start
    #[error("image of {len} bytes does not fit at 0x{start:08X}")]
    TooLarge {
        /// Start address
        start: u32,
        /// Image length
        len: usize,
    },

    /// One of the three UF2 magic numbers is wrong
    #[error("block {block}: bad magic number")]
    BadMagic {
        /// Block index
        block: usize,
    },

    /// The file ends in the middle of a block
    #[error("block {block}: truncated ({len} of 512 bytes)")]
    Truncated {
        /// Block index
        block: usize,
        /// Bytes actually present
        len: usize,
    },

    /// Declared payload does not fit in a block
    #[error("block {block}: payload size {size} exceeds 476 bytes")]
    PayloadTooLarge {
        /// Block index
        block: usize,
        /// Declared payload size
        size: u32,
    },

    /// Extension tag area is inconsistent
    #[error("block {block}: malformed extension tag at offset {offset}")]
    BadExtension {
        /// Block index
        block: usize,
        /// Offset of the bad tag within the block
        offset: usize,
    },

    /// Block number does not match the block position
    #[error("block {block}: block number {block_no} out of sequence")]
    OutOfSequence {
        /// Block index
        block: usize,
        /// Block number found in the header
        block_no: u32,
    },

    /// Total block count disagrees with the file
    #[error("block {block}: declares {declared} blocks, file has {actual}")]
    BlockCountMismatch {
        /// Block index
        block: usize,
        /// Count from the header
        declared: u32,
        /// Count derived from the file size
        actual: usize,
    },

    /// Family ID disagrees with the first block carrying one
    #[error("block {block}: family ID 0x{found:08X} differs from 0x{expected:08X}")]
    FamilyMismatch {
        /// Block index
        block: usize,
        /// Family ID of the first block
        expected: u32,
        /// Family ID of this block
        found: u32,
    },

    /// Payload runs past the end of the 32-bit address space
    #[error("block {block}: payload at 0x{address:08X} overflows the address space")]
    AddressOverflow {
        /// Block index
        block: usize,
        /// Target address of the block
        address: u32,
    },
}

/// Boxed iterator over the ranges of an image
pub type Ranges<'a> = Box<dyn Iterator<Item = Result<AddressRange<'a>, ImageError>> + 'a>;

/// Anything that can describe itself as a sequence of address ranges
///
/// `ranges()` starts from the beginning on every call, so an image can be
/// walked once for validation and again for flashing.
pub trait RangeSource<'a> {
    /// Iterate the ranges in file order
    fn ranges(&self) -> Ranges<'a>;

    /// Short human-readable format name
    fn format(&self) -> &'static str;
}

/// A raw binary flashed as a single range
#[derive(Debug, Clone, Copy)]
pub struct PlainImage<'a> {
    data: &'a [u8],
    start_address: u32,
}

impl<'a> PlainImage<'a> {
    /// Wrap a raw binary to be placed at `start_address`
    pub fn new(data: &'a [u8], start_address: u32) -> Self {
        Self {
            data,
            start_address,
        }
    }
}

impl<'a> RangeSource<'a> for PlainImage<'a> {
    fn ranges(&self) -> Ranges<'a> {
        let range = if self.data.is_empty() {
            Err(ImageError::Empty)
        } else if self.start_address as u64 + self.data.len() as u64 > 1 << 32 {
            Err(ImageError::TooLarge {
                start: self.start_address,
                len: self.data.len(),
            })
        } else {
            Ok(AddressRange::new(self.start_address, self.data))
        };
        Box::new(std::iter::once(range))
    }

    fn format(&self) -> &'static str {
        "binary"
    }
}

/// Pick the right [`RangeSource`] for `data`
///
/// UF2 containers carry their own addresses and ignore `start_address`.
/// Plain binaries require one.
pub fn open_image<'a>(
    data: &'a [u8],
    start_address: Option<u32>,
) -> Result<Box<dyn RangeSource<'a> + 'a>, ImageError> {
    if is_uf2(data) {
        return Ok(Box::new(Uf2Image::new(data)));
    }
    if data.is_empty() {
        return Err(ImageError::Empty);
    }
    let start = start_address.ok_or(ImageError::NoStartAddress)?;
    Ok(Box::new(PlainImage::new(data, start)))
}

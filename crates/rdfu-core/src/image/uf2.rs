//! UF2 container decoding
//!
//! A UF2 file is a sequence of self-describing 512-byte blocks:
//!
//! ```text
//!   0  magic0 (0x0A324655)     16  payload size
//!   4  magic1 (0x9E5D5157)     20  block number
//!   8  flags                   24  total blocks
//!  12  target address          28  file size / family ID
//!  32  payload, then extension tags (when flagged)
//! 508  final magic (0x0AB16F30)
//! ```
//!
//! [`Uf2Image::ranges`] merges contiguous main-flash blocks into address
//! ranges and turns reboot extension blocks into reboot markers.

use std::borrow::Cow;
use std::slice::Chunks;

use bitflags::bitflags;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::{AddressRange, ImageError, RangeSource, Ranges};

/// Size of every UF2 block
pub const BLOCK_SIZE: usize = 512;
/// Size of the fixed block header
pub const HEADER_SIZE: usize = 32;
/// Largest payload a block may carry
pub const MAX_PAYLOAD_SIZE: usize = BLOCK_SIZE - HEADER_SIZE - 4;

/// First magic number, "UF2\n"
pub const MAGIC_START0: u32 = 0x0A32_4655;
/// Second magic number
pub const MAGIC_START1: u32 = 0x9E5D_5157;
/// Magic number closing every block
pub const MAGIC_END: u32 = 0x0AB1_6F30;

/// Firmware version string
pub const VERSION_EXTENSION_TAG: u32 = 0x9F_C7BC;
/// Device description string
pub const DEVICE_EXTENSION_TAG: u32 = 0x65_0D9D;
/// Reboot marker carrying the restart address
pub const REBOOT_EXTENSION_TAG: u32 = 0xE6_0835;

bitflags! {
    /// UF2 block flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Uf2Flags: u32 {
        /// Block is not meant for main flash
        const NOT_MAIN_FLASH = 0x0000_0001;
        /// Block is part of a file container
        const FILE_CONTAINER = 0x0000_1000;
        /// The file size field holds a family ID
        const FAMILY_ID_PRESENT = 0x0000_2000;
        /// Block carries an MD5 checksum
        const MD5_CHECKSUM_PRESENT = 0x0000_4000;
        /// Extension tags follow the payload
        const EXTENSION_TAGS_PRESENT = 0x0000_8000;
    }
}

#[repr(C)]
#[derive(FromBytes, KnownLayout, Immutable)]
struct Uf2Header {
    magic_start0: U32<LittleEndian>,
    magic_start1: U32<LittleEndian>,
    flags: U32<LittleEndian>,
    target_addr: U32<LittleEndian>,
    payload_size: U32<LittleEndian>,
    block_no: U32<LittleEndian>,
    num_blocks: U32<LittleEndian>,
    file_size: U32<LittleEndian>,
}

/// Check whether `data` starts like a UF2 file
///
/// Only the first magic number is inspected; full validation happens while
/// iterating ranges.
pub fn is_uf2(data: &[u8]) -> bool {
    data.get(..4)
        .map(|magic| magic == MAGIC_START0.to_le_bytes())
        .unwrap_or(false)
}

/// One extension tag of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uf2Extension<'a> {
    /// 24-bit tag
    pub tag: u32,
    /// Tag payload, without header or padding
    pub payload: &'a [u8],
}

/// A decoded UF2 block borrowing from the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Block<'a> {
    /// Block flags
    pub flags: Uf2Flags,
    /// Device address of the payload
    pub target_addr: u32,
    /// Sequential block number
    pub block_no: u32,
    /// Total number of blocks in the file
    pub num_blocks: u32,
    /// File size, or family ID when [`Uf2Flags::FAMILY_ID_PRESENT`] is set
    pub file_size: u32,
    /// Payload bytes
    pub payload: &'a [u8],
    /// Extension tags following the payload
    pub extensions: Vec<Uf2Extension<'a>>,
}

impl<'a> Uf2Block<'a> {
    /// Decode and check one block
    ///
    /// `index` is only used to label errors.
    pub fn decode(index: usize, data: &'a [u8]) -> Result<Self, ImageError> {
        if data.len() != BLOCK_SIZE {
            return Err(ImageError::Truncated {
                block: index,
                len: data.len(),
            });
        }

        let (header, _) =
            Uf2Header::ref_from_prefix(data).map_err(|_| ImageError::Truncated {
                block: index,
                len: data.len(),
            })?;
        let magic_end = U32::<LittleEndian>::read_from_bytes(&data[BLOCK_SIZE - 4..])
            .map_err(|_| ImageError::Truncated {
                block: index,
                len: data.len(),
            })?
            .get();
        if header.magic_start0.get() != MAGIC_START0
            || header.magic_start1.get() != MAGIC_START1
            || magic_end != MAGIC_END
        {
            return Err(ImageError::BadMagic { block: index });
        }

        let payload_size = header.payload_size.get();
        if payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(ImageError::PayloadTooLarge {
                block: index,
                size: payload_size,
            });
        }

        let target_addr = header.target_addr.get();
        if target_addr as u64 + payload_size as u64 > 1 << 32 {
            return Err(ImageError::AddressOverflow {
                block: index,
                address: target_addr,
            });
        }

        let flags = Uf2Flags::from_bits_retain(header.flags.get());
        let payload_end = HEADER_SIZE + payload_size as usize;
        let extensions = if flags.contains(Uf2Flags::EXTENSION_TAGS_PRESENT) {
            decode_extensions(index, data, payload_end)?
        } else {
            Vec::new()
        };

        Ok(Uf2Block {
            flags,
            target_addr,
            block_no: header.block_no.get(),
            num_blocks: header.num_blocks.get(),
            file_size: header.file_size.get(),
            payload: &data[HEADER_SIZE..payload_end],
            extensions,
        })
    }

    /// Whether the payload targets main flash
    pub fn is_main_flash(&self) -> bool {
        !self.flags.contains(Uf2Flags::NOT_MAIN_FLASH)
    }

    /// Family ID, if the block carries one
    pub fn family_id(&self) -> Option<u32> {
        self.flags
            .contains(Uf2Flags::FAMILY_ID_PRESENT)
            .then_some(self.file_size)
    }

    /// Find an extension by tag
    pub fn extension(&self, tag: u32) -> Option<&Uf2Extension<'a>> {
        self.extensions.iter().find(|ext| ext.tag == tag)
    }

    /// Whether this block is a reboot marker
    pub fn is_reboot_block(&self) -> bool {
        !self.is_main_flash() && self.extension(REBOOT_EXTENSION_TAG).is_some()
    }

    /// Restart address carried by the reboot extension
    pub fn reboot_address(&self) -> Option<u32> {
        let payload = self.extension(REBOOT_EXTENSION_TAG)?.payload;
        Some(U32::<LittleEndian>::read_from_bytes(payload).ok()?.get())
    }

    /// Device description extension, if present and valid UTF-8
    pub fn device_description(&self) -> Option<&'a str> {
        self.extension_str(DEVICE_EXTENSION_TAG)
    }

    /// Version description extension, if present and valid UTF-8
    pub fn version_description(&self) -> Option<&'a str> {
        self.extension_str(VERSION_EXTENSION_TAG)
    }

    fn extension_str(&self, tag: u32) -> Option<&'a str> {
        let ext = self.extension(tag)?;
        std::str::from_utf8(ext.payload).ok()
    }
}

/// Decode the extension tag area starting at `offset`
///
/// Each tag starts with a little-endian header: length in the low byte
/// (header included), tag in the upper 24 bits. Tags are padded to 4 bytes
/// and a zero header ends the list.
fn decode_extensions(
    index: usize,
    block: &[u8],
    mut offset: usize,
) -> Result<Vec<Uf2Extension<'_>>, ImageError> {
    let area_end = BLOCK_SIZE - 4;
    let mut extensions = Vec::new();

    // Tags are aligned within the block
    offset = offset.next_multiple_of(4);

    while offset + 4 <= area_end {
        let hdr = U32::<LittleEndian>::read_from_bytes(&block[offset..offset + 4])
            .map_err(|_| ImageError::BadExtension {
                block: index,
                offset,
            })?
            .get();
        if hdr == 0 {
            break;
        }

        let len = (hdr & 0xFF) as usize;
        let tag = hdr >> 8;
        // A reboot tag must carry exactly one address
        if len < 4 || offset + len > area_end || (tag == REBOOT_EXTENSION_TAG && len != 8) {
            return Err(ImageError::BadExtension {
                block: index,
                offset,
            });
        }

        extensions.push(Uf2Extension {
            tag,
            payload: &block[offset + 4..offset + len],
        });
        offset += len.next_multiple_of(4);
    }

    Ok(extensions)
}

/// A UF2 file
#[derive(Debug, Clone, Copy)]
pub struct Uf2Image<'a> {
    data: &'a [u8],
}

impl<'a> Uf2Image<'a> {
    /// Wrap UF2 file contents; nothing is decoded until iteration
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Number of blocks in the file, counting a truncated trailing one
    pub fn block_count(&self) -> usize {
        self.data.len().div_ceil(BLOCK_SIZE)
    }

    /// Decode every block in order
    pub fn blocks(&self) -> impl Iterator<Item = Result<Uf2Block<'a>, ImageError>> + 'a {
        self.data
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(|(index, data)| Uf2Block::decode(index, data))
    }

    /// Iterate address ranges without boxing
    pub fn iter_ranges(&self) -> Uf2Ranges<'a> {
        Uf2Ranges {
            blocks: self.data.chunks(BLOCK_SIZE),
            index: 0,
            block_count: self.block_count(),
            family_id: None,
            pending: None,
            queued: None,
            failed: false,
        }
    }
}

impl<'a> RangeSource<'a> for Uf2Image<'a> {
    fn ranges(&self) -> Ranges<'a> {
        Box::new(self.iter_ranges())
    }

    fn format(&self) -> &'static str {
        "UF2"
    }
}

/// Lazy iterator over the address ranges of a UF2 file
///
/// Stops after yielding the first error.
pub struct Uf2Ranges<'a> {
    blocks: Chunks<'a, u8>,
    index: usize,
    block_count: usize,
    family_id: Option<u32>,
    /// Range being extended by contiguous blocks
    pending: Option<AddressRange<'a>>,
    /// Reboot marker to hand out after `pending`
    queued: Option<AddressRange<'a>>,
    failed: bool,
}

impl<'a> Uf2Ranges<'a> {
    fn next_block(&mut self) -> Option<Result<Uf2Block<'a>, ImageError>> {
        let data = self.blocks.next()?;
        let index = self.index;
        self.index += 1;
        Some(self.check(index, data))
    }

    fn check(&mut self, index: usize, data: &'a [u8]) -> Result<Uf2Block<'a>, ImageError> {
        let block = Uf2Block::decode(index, data)?;

        if block.block_no as usize != index {
            return Err(ImageError::OutOfSequence {
                block: index,
                block_no: block.block_no,
            });
        }
        if block.num_blocks as usize != self.block_count {
            return Err(ImageError::BlockCountMismatch {
                block: index,
                declared: block.num_blocks,
                actual: self.block_count,
            });
        }
        if let Some(found) = block.family_id() {
            match self.family_id {
                Some(expected) if expected != found => {
                    return Err(ImageError::FamilyMismatch {
                        block: index,
                        expected,
                        found,
                    });
                }
                Some(_) => {}
                None => self.family_id = Some(found),
            }
        }

        Ok(block)
    }
}

impl<'a> Iterator for Uf2Ranges<'a> {
    type Item = Result<AddressRange<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(marker) = self.queued.take() {
            return Some(Ok(marker));
        }

        while let Some(block) = self.next_block() {
            let block = match block {
                Ok(block) => block,
                Err(e) => {
                    self.failed = true;
                    self.pending = None;
                    return Some(Err(e));
                }
            };

            if block.is_reboot_block() {
                let marker = AddressRange {
                    start_address: block.target_addr,
                    payload: Cow::Borrowed(block.payload),
                    reboot_address: block.reboot_address(),
                };
                log::trace!(
                    "UF2 block {}: reboot marker at 0x{:08X}",
                    block.block_no,
                    block.target_addr
                );
                return match self.pending.take() {
                    Some(range) => {
                        self.queued = Some(marker);
                        Some(Ok(range))
                    }
                    None => Some(Ok(marker)),
                };
            }

            if !block.is_main_flash() || block.payload.is_empty() {
                log::trace!("UF2 block {}: skipped", block.block_no);
                continue;
            }

            match self.pending.as_mut() {
                Some(range) if range.end_exclusive() == block.target_addr as u64 => {
                    range.payload.to_mut().extend_from_slice(block.payload);
                }
                _ => {
                    let range = AddressRange::new(block.target_addr, block.payload);
                    if let Some(done) = self.pending.replace(range) {
                        return Some(Ok(done));
                    }
                }
            }
        }

        self.pending.take().map(Ok)
    }
}

//! DfuSe memory layouts
//!
//! DfuSe devices describe each alternate setting with a string such as
//! `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`: a name, then
//! one or more groups of a hex start address followed by comma separated
//! segments `<count>*<size><unit><type>`. Segments of a group are laid out
//! back to back from the group start.

use bitflags::bitflags;
use regex::{Captures, Regex};

use crate::plan::EraseRegion;

bitflags! {
    /// Access rights of a memory segment
    ///
    /// Encoded in the low three bits of the type letter (`a`..`g`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u8 {
        /// Segment can be uploaded
        const READABLE = 0x01;
        /// Segment can be erased
        const ERASABLE = 0x02;
        /// Segment can be downloaded
        const WRITABLE = 0x04;
    }
}

/// A run of equally sized pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    /// First address
    pub start: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Number of pages
    pub page_count: u32,
    /// Access rights
    pub flags: SegmentFlags,
}

impl MemorySegment {
    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.start as u64 + self.page_size as u64 * self.page_count as u64
    }

    /// Last address (inclusive), saturated to the address space
    pub fn last_address(&self) -> u32 {
        self.end().saturating_sub(1).min(u32::MAX as u64) as u32
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.end() - self.start as u64
    }

    /// Whether `[start, end]` overlaps the segment
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        (start as u64) < self.end() && end >= self.start
    }

    /// Whether the segment can be uploaded
    pub fn readable(&self) -> bool {
        self.flags.contains(SegmentFlags::READABLE)
    }

    /// Whether the segment can be erased
    pub fn erasable(&self) -> bool {
        self.flags.contains(SegmentFlags::ERASABLE)
    }

    /// Whether the segment can be downloaded
    pub fn writable(&self) -> bool {
        self.flags.contains(SegmentFlags::WRITABLE)
    }

    /// Erase geometry of the segment
    pub fn erase_region(&self) -> EraseRegion {
        EraseRegion {
            start: self.start,
            page_size: self.page_size,
            page_count: self.page_count,
            erasable: self.erasable(),
        }
    }
}

/// A named memory described by one alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Memory name, e.g. "Internal Flash"
    pub name: String,
    /// Segments in declaration order
    pub segments: Vec<MemorySegment>,
}

impl MemoryLayout {
    /// First address of the first segment
    pub fn start_address(&self) -> Option<u32> {
        self.segments.first().map(|s| s.start)
    }

    /// Segments overlapping `[start, end]`
    pub fn find_segments(&self, start: u32, end: u32) -> Vec<&MemorySegment> {
        self.segments
            .iter()
            .filter(|s| s.overlaps(start, end))
            .collect()
    }

    /// Whether `[start, end]` lies entirely within contiguous segments
    pub fn covers(&self, start: u32, end: u32) -> bool {
        if start > end {
            return false;
        }
        let mut segments = self.find_segments(start, end);
        segments.sort_by_key(|s| s.start);

        let mut covered = start as u64;
        for segment in segments {
            if segment.start as u64 > covered {
                return false;
            }
            covered = covered.max(segment.end());
        }
        covered > end as u64
    }

    /// Bytes from `start` to the end of the contiguous segments holding it
    pub fn span_from(&self, start: u32) -> Option<u64> {
        let mut segments: Vec<&MemorySegment> = self.segments.iter().collect();
        segments.sort_by_key(|s| s.start);

        let mut end: Option<u64> = None;
        for segment in segments {
            match end {
                None if segment.overlaps(start, start) => end = Some(segment.end()),
                Some(e) if segment.start as u64 == e => end = Some(segment.end()),
                Some(_) => break,
                None => {}
            }
        }
        end.map(|e| e - start as u64)
    }

    /// Erase regions for the writable segments overlapping `[start, end]`
    pub fn erase_regions(&self, start: u32, end: u32) -> Vec<EraseRegion> {
        self.find_segments(start, end)
            .into_iter()
            .filter(|s| s.writable())
            .map(MemorySegment::erase_region)
            .collect()
    }
}

/// Name followed by the first `/0x...` group
const LAYOUT_PATTERN: &str = r"^@?([^/]*?)\s*(/0x.*)$";
/// Hex start address and the segment list that follows it
const GROUP_PATTERN: &str = r"/0x([\da-fA-F]+)U?/([^/]*)";
/// `<count>*<size><unit><type>`
const SEGMENT_PATTERN: &str = r"(\d+)\*(\d+)([KMB ])([a-g])(?:,|$)";

/// Parse a DfuSe interface string
///
/// Returns `None` when the string is not a memory layout, which is the case
/// for plain DFU devices and for interfaces without a description.
/// Segments that do not match the `<count>*<size><unit><type>` form are
/// skipped.
pub fn parse_memory_layout(s: &str) -> Option<MemoryLayout> {
    let layout_re = Regex::new(LAYOUT_PATTERN).ok()?;
    let group_re = Regex::new(GROUP_PATTERN).ok()?;
    let segment_re = Regex::new(SEGMENT_PATTERN).ok()?;

    let s = s.trim_end_matches(['\0', '\r', '\n']);
    let captures = layout_re.captures(s)?;
    let name = captures[1].trim().to_string();

    let mut segments = Vec::new();
    for group in group_re.captures_iter(&captures[2]) {
        let mut current = u32::from_str_radix(&group[1], 16).ok()?;

        for segment in segment_re.captures_iter(group[2].trim_end()) {
            let segment = parse_segment(current, &segment)?;
            current = u32::try_from(segment.end()).ok()?;
            segments.push(segment);
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(MemoryLayout { name, segments })
}

/// Build the segment at `start` from a [`SEGMENT_PATTERN`] match
fn parse_segment(start: u32, captures: &Captures<'_>) -> Option<MemorySegment> {
    let page_count: u32 = captures[1].parse().ok()?;
    let size: u32 = captures[2].parse().ok()?;
    let multiplier = match &captures[3] {
        "K" => 1024,
        "M" => 1024 * 1024,
        _ => 1,
    };
    let kind = captures[4].bytes().next()?;

    let segment = MemorySegment {
        start,
        page_size: size.checked_mul(multiplier)?,
        page_count,
        flags: SegmentFlags::from_bits_truncate(kind & 0x07),
    };
    // Reject layouts running past the address space
    if segment.end() > 1 << 32 {
        return None;
    }
    Some(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_bytes() {
        let layout = parse_memory_layout("@Option Bytes   /0x5200201C/01*128 e").unwrap();
        assert_eq!(layout.name, "Option Bytes");
        assert_eq!(
            layout.segments,
            vec![MemorySegment {
                start: 0x5200_201C,
                page_size: 128,
                page_count: 1,
                flags: SegmentFlags::from_bits_truncate(b'e' & 7),
            }]
        );
        assert!(layout.segments[0].readable());
        assert!(!layout.segments[0].erasable());
        assert!(layout.segments[0].writable());

        let regions = layout.erase_regions(0x5200_201C, 0x5200_209B);
        assert_eq!(regions.len(), 1);
        assert!(!regions[0].erasable);
    }

    #[test]
    fn test_internal_flash() {
        let layout = parse_memory_layout("@Internal Flash   /0x08000000/8*08Kg").unwrap();
        assert_eq!(layout.name, "Internal Flash");
        assert_eq!(layout.segments.len(), 1);
        let segment = &layout.segments[0];
        assert_eq!(segment.start, 0x0800_0000);
        assert_eq!(segment.page_size, 8 * 1024);
        assert_eq!(segment.page_count, 8);
        assert_eq!(segment.end(), 0x0800_0000 + 64 * 1024);
        assert_eq!(segment.flags, SegmentFlags::all());
        assert_eq!(layout.start_address(), Some(0x0800_0000));
    }

    #[test]
    fn test_mixed_sectors() {
        let layout =
            parse_memory_layout("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();
        let starts: Vec<u32> = layout.segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0x0800_0000, 0x0801_0000, 0x0802_0000]);
        assert_eq!(layout.segments[2].page_size, 128 * 1024);
        assert_eq!(layout.segments[2].last_address(), 0x080F_FFFF);

        assert!(layout.covers(0x0800_0000, 0x080F_FFFF));
        assert!(!layout.covers(0x0800_0000, 0x0810_0000));
        assert_eq!(layout.find_segments(0x0800_F000, 0x0801_0000).len(), 2);

        assert_eq!(layout.span_from(0x0800_0000), Some(1024 * 1024));
        assert_eq!(layout.span_from(0x080F_FF00), Some(0x100));
        assert_eq!(layout.span_from(0x0810_0000), None);

        let regions = layout.erase_regions(0x0801_0000, 0x0802_0000);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].page_size, 64 * 1024);
    }

    #[test]
    fn test_multiple_groups() {
        let layout =
            parse_memory_layout("@Flash/0x08000000/2*1Ka/0x08100000U/4*2Kg").unwrap();
        assert_eq!(layout.name, "Flash");
        assert_eq!(layout.segments.len(), 2);
        assert_eq!(layout.segments[0].flags, SegmentFlags::READABLE);
        assert_eq!(layout.segments[1].start, 0x0810_0000);
        assert!(!layout.covers(0x0800_0000, 0x0810_0000));
        assert!(layout.erase_regions(0x0800_0000, 0x0800_07FF).is_empty());
        assert_eq!(layout.span_from(0x0800_0400), Some(0x400));
    }

    #[test]
    fn test_megabyte_unit() {
        let layout = parse_memory_layout("@SPI Flash /0x90000000/16*1Mg").unwrap();
        assert_eq!(layout.segments[0].page_size, 1024 * 1024);
        assert_eq!(layout.segments[0].size(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_string_descriptor_padding() {
        let layout =
            parse_memory_layout("@Internal Flash  /0x08000000/04*016Kg,01*064Kg \0\0").unwrap();
        assert_eq!(layout.segments.len(), 2);
        assert_eq!(layout.segments[1].start, 0x0801_0000);
    }

    #[test]
    fn test_unknown_segments_skipped() {
        let layout = parse_memory_layout("@Flash/0x08000000/1*1Xg,2*1Kg").unwrap();
        assert_eq!(layout.segments.len(), 1);
        assert_eq!(layout.segments[0].page_count, 2);
        assert_eq!(layout.segments[0].start, 0x0800_0000);
    }

    #[test]
    fn test_invalid_layouts() {
        assert_eq!(parse_memory_layout(""), None);
        assert_eq!(parse_memory_layout("STM32 BOOTLOADER"), None);
        assert_eq!(parse_memory_layout("@Flash/0x08000000/"), None);
        assert_eq!(parse_memory_layout("@Flash/08000000/1*1Kg"), None);
        assert_eq!(parse_memory_layout("@Flash/0x08000000/1*1Xg"), None);
        assert_eq!(parse_memory_layout("@Flash/0x08000000/1*1Kz"), None);
        assert_eq!(parse_memory_layout("@Flash/0xFFFFF000/8*1Kg"), None);
    }
}

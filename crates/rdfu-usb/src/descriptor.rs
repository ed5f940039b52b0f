//! DFU functional descriptor

use bitflags::bitflags;

/// Descriptor type of the DFU functional descriptor
pub(crate) const DFU_DESCRIPTOR_TYPE: u8 = 0x21;
/// Length of the DFU functional descriptor
pub(crate) const DFU_DESCRIPTOR_LEN: usize = 9;

/// bcdDFUVersion announced by DfuSe devices
pub const DFUSE_VERSION: u16 = 0x011A;

bitflags! {
    /// bmAttributes of the functional descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DfuAttributes: u8 {
        /// bitCanDnload
        const CAN_DOWNLOAD = 1 << 0;
        /// bitCanUpload
        const CAN_UPLOAD = 1 << 1;
        /// bitManifestationTolerant
        const MANIFESTATION_TOLERANT = 1 << 2;
        /// bitWillDetach
        const WILL_DETACH = 1 << 3;
    }
}

/// DFU functional descriptor (DFU 1.1, section 4.1.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DfuDescriptor {
    /// Capabilities
    pub attributes: DfuAttributes,
    /// wDetachTimeOut in milliseconds
    pub detach_timeout: u16,
    /// wTransferSize: largest control write the device accepts
    pub transfer_size: u16,
    /// bcdDFUVersion
    pub dfu_version: u16,
}

impl DfuDescriptor {
    /// Decode a raw descriptor, including its length and type bytes
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < DFU_DESCRIPTOR_LEN || raw[1] != DFU_DESCRIPTOR_TYPE {
            return None;
        }
        Some(Self {
            attributes: DfuAttributes::from_bits_truncate(raw[2]),
            detach_timeout: u16::from_le_bytes([raw[3], raw[4]]),
            transfer_size: u16::from_le_bytes([raw[5], raw[6]]),
            dfu_version: u16::from_le_bytes([raw[7], raw[8]]),
        })
    }

    /// Whether the device speaks the DfuSe extensions
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION
    }
}

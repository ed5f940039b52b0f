//! DFU and DfuSe protocol constants

use std::fmt;
use std::time::Duration;

use crate::error::{Result, UsbDfuError};

// DFU class requests
pub(crate) const DFU_DNLOAD: u8 = 1;
pub(crate) const DFU_UPLOAD: u8 = 2;
pub(crate) const DFU_GETSTATUS: u8 = 3;
pub(crate) const DFU_CLRSTATUS: u8 = 4;
pub(crate) const DFU_ABORT: u8 = 6;

/// Length of a GETSTATUS response
pub(crate) const DFU_STATUS_LEN: u16 = 6;

// DfuSe commands, sent as DNLOAD block 0
pub(crate) const DFUSE_SET_ADDRESS: u8 = 0x21;
pub(crate) const DFUSE_ERASE: u8 = 0x41;

/// DNLOAD/UPLOAD block number of the first data block
pub(crate) const DFUSE_DATA_BLOCK: u16 = 2;

/// Device state (bState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    /// appIDLE
    AppIdle,
    /// appDETACH
    AppDetach,
    /// dfuIDLE
    DfuIdle,
    /// dfuDNLOAD-SYNC
    DownloadSync,
    /// dfuDNBUSY
    DownloadBusy,
    /// dfuDNLOAD-IDLE
    DownloadIdle,
    /// dfuMANIFEST-SYNC
    ManifestSync,
    /// dfuMANIFEST
    Manifest,
    /// dfuMANIFEST-WAIT-RESET
    ManifestWaitReset,
    /// dfuUPLOAD-IDLE
    UploadIdle,
    /// dfuERROR
    Error,
    /// Anything else
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DownloadSync,
            0x04 => DfuState::DownloadBusy,
            0x05 => DfuState::DownloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0A => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DownloadSync => "dfuDNLOAD-SYNC",
            DfuState::DownloadBusy => "dfuDNBUSY",
            DfuState::DownloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::Error => "dfuERROR",
            DfuState::Unknown(v) => return write!(f, "unknown ({:#04x})", v),
        };
        f.write_str(name)
    }
}

/// Decoded GETSTATUS response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    /// bStatus, zero when OK
    pub status: u8,
    /// bwPollTimeout: how long to wait before the next GETSTATUS
    pub poll_timeout: Duration,
    /// bState
    pub state: DfuState,
}

impl DfuStatus {
    /// Decode the 6-byte GETSTATUS payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(UsbDfuError::InvalidResponse(format!(
                "GETSTATUS returned {} bytes",
                data.len()
            )));
        }
        let poll_ms = u32::from_le_bytes([data[1], data[2], data[3], 0]);
        Ok(Self {
            status: data[0],
            poll_timeout: Duration::from_millis(poll_ms as u64),
            state: DfuState::from(data[4]),
        })
    }

    /// Whether the device reports no error
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero status into an error
    pub fn check(&self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(UsbDfuError::Status {
                status: self.status,
                state: self.state,
            })
        }
    }
}

/// Build a DfuSe command payload carrying an address
pub(crate) fn dfuse_command(command: u8, address: u32) -> [u8; 5] {
    let [a0, a1, a2, a3] = address.to_le_bytes();
    [command, a0, a1, a2, a3]
}

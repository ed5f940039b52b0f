//! Error types for the USB transport

use thiserror::Error;

use crate::protocol::DfuState;

/// Errors from DFU requests over USB
#[derive(Debug, Error)]
pub enum UsbDfuError {
    /// Opening, claiming or enumerating failed
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    /// A control transfer failed
    #[error("transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// The device reported a non-zero status
    #[error("device reported status {status:#04x} in state {state}")]
    Status {
        /// bStatus
        status: u8,
        /// bState
        state: DfuState,
    },

    /// No interface exposes memory for the requested window
    #[error("no memory segments cover 0x{start:08X}..=0x{end:08X}")]
    NoMemorySegments {
        /// First address of the window
        start: u32,
        /// Last address of the window
        end: u32,
    },

    /// The device stayed busy for too long
    #[error("timed out waiting for the device")]
    Timeout,

    /// The device answered something we cannot interpret
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for USB DFU operations
pub type Result<T> = std::result::Result<T, UsbDfuError>;

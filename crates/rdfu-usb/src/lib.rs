//! rdfu-usb - USB DFU transport with STM32 DfuSe extensions
//!
//! This crate implements [`rdfu_core::DfuDevice`] on top of [`nusb`]:
//! device enumeration, functional descriptor decoding and the DFU/DfuSe
//! control requests (set address, page erase, download, upload).
//!
//! Useful references:
//! - USB Device Firmware Upgrade Specification, Revision 1.1
//! - STMicroelectronics AN3156, USB DFU protocol used in the STM32 bootloader
//!
//! # Example
//!
//! ```ignore
//! use rdfu_core::DeviceFilter;
//! use rdfu_usb::find_devices;
//!
//! for device in find_devices(&DeviceFilter::any())? {
//!     println!("{:04x}:{:04x}", device.info().vendor_id, device.info().product_id);
//! }
//! ```

#![warn(missing_docs)]

mod connection;
mod descriptor;
mod device;
mod error;
mod protocol;

use std::time::Duration;

pub use connection::DfuConnection;
pub use descriptor::{DfuAttributes, DfuDescriptor, DFUSE_VERSION};
pub use device::{find_devices, UsbDfuDevice, UsbRebooting};
pub use error::{Result, UsbDfuError};
pub use protocol::{DfuState, DfuStatus};

/// Timeout for a single control transfer
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transfer size used when the device has no functional descriptor
pub const DEFAULT_TRANSFER_SIZE: u16 = 2048;

/// Longest time to wait for a download to be processed
pub(crate) const STATUS_POLL_TIMEOUT: Duration = Duration::from_secs(10);

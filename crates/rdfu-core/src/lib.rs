//! rdfu-core - Flashing engine for USB DFU devices
//!
//! This crate contains everything needed to turn a firmware image and a
//! connected device into an ordered sequence of erase and download
//! requests. It knows nothing about USB: the transport is provided by any
//! type implementing [`DfuDevice`] (see the `rdfu-usb` crate for the real
//! one and `rdfu-dummy` for an in-memory device).
//!
//! # Overview
//!
//! - [`image`] - plain binary and UF2 container parsing into address ranges
//! - [`plan`] - erase page planning and transfer chunking
//! - [`session`] - erase-then-program of a single address range
//! - [`reboot`] - reboot command and bounded rediscovery polling
//! - [`flash`] - whole-image orchestration
//! - [`memory`] - DfuSe memory layout strings
//! - [`read`] - reading device memory back
//!
//! # Example
//!
//! ```ignore
//! use rdfu_core::flash::{flash, FlashOptions};
//! use rdfu_core::progress::NoProgress;
//! use rdfu_core::reboot::SystemClock;
//!
//! let image = std::fs::read("firmware.uf2")?;
//! flash(device, &image, &FlashOptions::default(), &SystemClock, &mut NoProgress)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod device;
pub mod error;
pub mod flash;
pub mod image;
pub mod memory;
pub mod plan;
pub mod progress;
pub mod read;
pub mod reboot;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{DeviceFilter, DeviceInfo, DfuDevice, DfuUpload, DownloadContext, Rediscover};
pub use error::{DeviceError, Error, Result};
pub use image::{AddressRange, ImageError};

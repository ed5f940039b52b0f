//! Error types for rdfu-core
//!
//! Every error terminates the flashing run. The variants identify the stage
//! that failed so the CLI can print a single meaningful message.

use std::time::Duration;

use thiserror::Error;

use crate::image::ImageError;

/// Boxed error coming from a device transport
pub type DeviceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// The firmware image is not a well-formed container
    #[error("malformed image: {0}")]
    MalformedImage(#[from] ImageError),

    /// The device reported a page or transfer geometry we cannot work with
    #[error("invalid device geometry: {0}")]
    InvalidDeviceGeometry(String),

    /// The device rejected a page erase
    #[error("erase failed at 0x{address:08X}: {source}")]
    EraseFailure {
        /// Address of the page being erased
        address: u32,
        /// Transport error
        source: DeviceError,
    },

    /// The device rejected a download
    #[error("transfer failed at 0x{address:08X}: {source}")]
    TransferFailure {
        /// Address of the chunk being transferred
        address: u32,
        /// Transport error
        source: DeviceError,
    },

    /// The device did not come back after a reboot
    #[error("device did not reappear within {0:?} after reboot")]
    RediscoveryTimeout(Duration),

    /// Discovery returned no device
    #[error("no DFU device found")]
    NoDeviceFound,

    /// Discovery returned more devices than we can flash
    #[error("more than one DFU device found ({0}), use --vendor/--product to select one")]
    MultipleDevices(usize),

    /// Any other device request failed
    #[error("{stage} failed: {source}")]
    Device {
        /// Short name of the failing request
        stage: &'static str,
        /// Transport error
        source: DeviceError,
    },
}

impl Error {
    /// Wrap a transport error for a given stage
    pub fn device<E>(stage: &'static str) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |e| Error::Device {
            stage,
            source: Box::new(e),
        }
    }

    pub(crate) fn geometry(msg: impl Into<String>) -> Self {
        Error::InvalidDeviceGeometry(msg.into())
    }
}

/// Result type alias using the core Error type
pub type Result<T> = std::result::Result<T, Error>;

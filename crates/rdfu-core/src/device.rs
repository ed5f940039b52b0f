//! Device abstraction
//!
//! The flashing engine talks to devices only through the traits in this
//! module. A handle is consumed by [`DfuDevice::reboot`] and
//! [`DfuDevice::leave`]: after a reboot the only way to reach the device
//! again is through the returned [`Rediscover`] token, so a stale handle can
//! never be used.

use crate::memory::MemoryLayout;

pub use crate::plan::DownloadContext;

/// Selects devices by USB identifiers
///
/// A field left as `None` matches any value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// USB vendor ID
    pub vendor_id: Option<u16>,
    /// USB product ID
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Filter matching every device
    pub fn any() -> Self {
        Self::default()
    }

    /// Filter matching exactly one vendor/product pair
    pub fn exact(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Check a vendor/product pair against the filter
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

/// One DFU alternate setting and the memory it exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface number
    pub interface: u8,
    /// Alternate setting
    pub alt_setting: u8,
    /// Parsed memory layout
    pub layout: MemoryLayout,
}

impl InterfaceInfo {
    /// Memory name from the interface string
    pub fn name(&self) -> &str {
        &self.layout.name
    }
}

/// Static description of a DFU device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Product string, empty when the device has none
    pub product_string: String,
    /// Bus identifier
    pub bus_id: String,
    /// Address on the bus
    pub device_address: u8,
    /// Whether the device speaks the DfuSe extensions
    pub dfuse: bool,
    /// Alternate settings with a usable memory layout
    pub interfaces: Vec<InterfaceInfo>,
}

impl DeviceInfo {
    /// Start of the first segment of the first interface
    pub fn default_start_address(&self) -> Option<u32> {
        self.interfaces
            .first()
            .and_then(|intf| intf.layout.start_address())
    }

    /// Interface whose memory contains `[start, end]`
    pub fn find_interface(&self, start: u32, end: u32) -> Option<&InterfaceInfo> {
        self.interfaces
            .iter()
            .find(|intf| intf.layout.covers(start, end))
    }
}

/// A DFU device in bootloader mode
pub trait DfuDevice: Sized {
    /// Transport error
    type Error: std::error::Error + Send + Sync + 'static;

    /// Token used to find the device again after a reboot
    type Rebooting: Rediscover<Device = Self>;

    /// Static device description
    fn info(&self) -> &DeviceInfo;

    /// Where a plain binary goes when no address is given
    fn default_start_address(&self) -> Option<u32> {
        self.info().default_start_address()
    }

    /// Bring the device back to the idle state
    fn reset_state(&mut self) -> Result<(), Self::Error>;

    /// Prepare a download of `[start, end]` and report the geometry to use
    fn start_download(&mut self, start: u32, end: u32) -> Result<DownloadContext, Self::Error>;

    /// Erase the page beginning at `address`
    fn erase_page(&mut self, address: u32) -> Result<(), Self::Error>;

    /// Write `data` at `address`; `data` never exceeds the transfer size
    fn download(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Write `data` at `address`, then restart the device at `reboot_address`
    ///
    /// The device disconnects; the handle is consumed.
    fn reboot(self, address: u32, data: &[u8], reboot_address: u32)
        -> Result<Self::Rebooting, Self::Error>;

    /// Leave DFU mode and start the application
    fn leave(self) -> Result<(), Self::Error>;
}

/// Finds a device again after it re-enumerated
pub trait Rediscover {
    /// Handle type produced once the device is back
    type Device;

    /// Rediscovery error
    type Error: std::error::Error + Send + Sync + 'static;

    /// Poll the bus once; `Ok(None)` while the device is still away
    fn rediscover(&mut self) -> Result<Option<Self::Device>, Self::Error>;
}

/// A DFU device that supports reading memory back
pub trait DfuUpload: DfuDevice {
    /// Prepare reading `length` bytes at `start`, returning the block size
    fn start_upload(&mut self, start: u32, length: usize) -> Result<u16, Self::Error>;

    /// Read up to `length` bytes at `address`
    ///
    /// `address` advances by the block size from the upload start.
    fn upload(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Self::Error>;
}

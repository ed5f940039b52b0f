//! DFU device discovery and the [`DfuDevice`] implementation

use std::num::NonZeroU8;

use nusb::MaybeFuture;
use rdfu_core::device::{DeviceFilter, DeviceInfo, DfuDevice, DfuUpload, InterfaceInfo, Rediscover};
use rdfu_core::memory::parse_memory_layout;
use rdfu_core::plan::DownloadContext;

use crate::connection::DfuConnection;
use crate::descriptor::{DfuDescriptor, DFU_DESCRIPTOR_LEN, DFU_DESCRIPTOR_TYPE};
use crate::error::{Result, UsbDfuError};
use crate::DEFAULT_TIMEOUT;

/// Application specific class
const DFU_CLASS: u8 = 0xFE;
/// Device firmware upgrade subclass
const DFU_SUBCLASS: u8 = 0x01;

/// A DFU device on the USB bus
pub struct UsbDfuDevice {
    info: DeviceInfo,
    device: nusb::Device,
    descriptor: Option<DfuDescriptor>,
    connection: Option<DfuConnection>,
    upload_start: u32,
}

impl std::fmt::Debug for UsbDfuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDfuDevice")
            .field("info", &self.info)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl UsbDfuDevice {
    fn from_usb(usb: &nusb::DeviceInfo) -> Result<Option<Self>> {
        let device = usb.open().wait()?;

        let mut descriptor = None;
        let mut interfaces = Vec::new();
        for config in device.configurations() {
            for alt in config.interface_alt_settings() {
                if alt.class() != DFU_CLASS || alt.subclass() != DFU_SUBCLASS {
                    continue;
                }
                if descriptor.is_none() {
                    descriptor = alt
                        .descriptors()
                        .filter(|d| {
                            d.descriptor_type() == DFU_DESCRIPTOR_TYPE
                                && d.descriptor_len() == DFU_DESCRIPTOR_LEN
                        })
                        .find_map(|d| DfuDescriptor::parse(&d));
                }
                let Some(name) = alt.string_index().and_then(|idx| read_string(&device, idx))
                else {
                    log::debug!(
                        "Interface {} alt {} has no name",
                        alt.interface_number(),
                        alt.alternate_setting()
                    );
                    continue;
                };
                match parse_memory_layout(&name) {
                    Some(layout) => interfaces.push(InterfaceInfo {
                        interface: alt.interface_number(),
                        alt_setting: alt.alternate_setting(),
                        layout,
                    }),
                    None => log::debug!("Skipping interface {:?}: not a memory layout", name),
                }
            }
        }

        if interfaces.is_empty() {
            log::debug!(
                "{:04x}:{:04x} exposes no usable DFU interface",
                usb.vendor_id(),
                usb.product_id()
            );
            return Ok(None);
        }

        let info = DeviceInfo {
            vendor_id: usb.vendor_id(),
            product_id: usb.product_id(),
            product_string: usb.product_string().unwrap_or_default().to_string(),
            bus_id: usb.bus_id().to_string(),
            device_address: usb.device_address(),
            dfuse: descriptor.is_some_and(|d| d.is_dfuse()),
            interfaces,
        };
        Ok(Some(Self {
            info,
            device,
            descriptor,
            connection: None,
            upload_start: 0,
        }))
    }

    /// Functional descriptor, if the device has one
    pub fn descriptor(&self) -> Option<&DfuDescriptor> {
        self.descriptor.as_ref()
    }

    fn transfer_size(&self) -> u16 {
        self.descriptor.map_or(0, |d| d.transfer_size)
    }

    /// Claim `interface`/`alt_setting`, reusing the current claim if it matches
    fn connect(&mut self, interface: u8, alt_setting: u8) -> Result<&DfuConnection> {
        if let Some(conn) = self.connection.take() {
            if conn.interface_number() == interface && conn.alt_setting() == alt_setting {
                return Ok(self.connection.insert(conn));
            }
        }
        let conn = DfuConnection::open(&self.device, interface, alt_setting, self.transfer_size())?;
        Ok(self.connection.insert(conn))
    }

    /// Connect to the interface holding `[start, end]`
    fn connect_for(&mut self, start: u32, end: u32) -> Result<&DfuConnection> {
        let intf = self
            .info
            .find_interface(start, end)
            .ok_or(UsbDfuError::NoMemorySegments { start, end })?;
        let (interface, alt_setting) = (intf.interface, intf.alt_setting);
        self.connect(interface, alt_setting)
    }

    /// The claimed connection, or the first interface
    fn connection(&mut self) -> Result<&DfuConnection> {
        if let Some(conn) = self.connection.take() {
            return Ok(self.connection.insert(conn));
        }
        let intf = self.info.interfaces.first().ok_or(UsbDfuError::NoMemorySegments {
            start: 0,
            end: u32::MAX,
        })?;
        let (interface, alt_setting) = (intf.interface, intf.alt_setting);
        self.connect(interface, alt_setting)
    }
}

/// Map the interface holding `[start, end]` to download geometry
pub(crate) fn download_context(
    info: &DeviceInfo,
    start: u32,
    end: u32,
    transfer_size: u16,
) -> Result<DownloadContext> {
    let intf = info
        .find_interface(start, end)
        .ok_or(UsbDfuError::NoMemorySegments { start, end })?;
    Ok(DownloadContext {
        max_transfer_size: if transfer_size > 0 {
            transfer_size
        } else {
            crate::DEFAULT_TRANSFER_SIZE
        },
        regions: intf.layout.erase_regions(start, end),
    })
}

fn read_string(device: &nusb::Device, index: NonZeroU8) -> Option<String> {
    let language = device
        .get_string_descriptor_supported_languages(DEFAULT_TIMEOUT)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);
    device
        .get_string_descriptor(index, language, DEFAULT_TIMEOUT)
        .wait()
        .ok()
}

fn is_dfu_device(usb: &nusb::DeviceInfo) -> bool {
    usb.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Enumerate DFU devices matching `filter`
pub fn find_devices(filter: &DeviceFilter) -> Result<Vec<UsbDfuDevice>> {
    let candidates: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|d| filter.matches(d.vendor_id(), d.product_id()))
        .filter(is_dfu_device)
        .collect();

    let mut devices = Vec::with_capacity(candidates.len());
    for usb in &candidates {
        if let Some(device) = UsbDfuDevice::from_usb(usb)? {
            devices.push(device);
        }
    }
    log::debug!("Found {} DFU device(s)", devices.len());
    Ok(devices)
}

impl DfuDevice for UsbDfuDevice {
    type Error = UsbDfuError;
    type Rebooting = UsbRebooting;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn reset_state(&mut self) -> Result<()> {
        self.connection()?.reset_state()
    }

    fn start_download(&mut self, start: u32, end: u32) -> Result<DownloadContext> {
        let ctx = download_context(&self.info, start, end, self.transfer_size())?;
        self.connect_for(start, end)?.reset_state()?;
        Ok(ctx)
    }

    fn erase_page(&mut self, address: u32) -> Result<()> {
        self.connection()?.erase_page(address)
    }

    fn download(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.connection()?.download(address, data)
    }

    fn reboot(mut self, address: u32, data: &[u8], reboot_address: u32) -> Result<UsbRebooting> {
        // The trigger often lives in RAM, outside every advertised layout
        let end = address.saturating_add((data.len() as u32).saturating_sub(1));
        let conn = if self.info.find_interface(address, end).is_some() {
            self.connect_for(address, end)?
        } else {
            self.connection()?
        };
        conn.reset_state()?;
        conn.reboot(address, data, reboot_address)?;
        Ok(UsbRebooting::new(&self.info))
    }

    fn leave(mut self) -> Result<()> {
        self.connection()?.leave()
    }
}

impl DfuUpload for UsbDfuDevice {
    fn start_upload(&mut self, start: u32, length: usize) -> Result<u16> {
        let end = start.saturating_add((length as u32).saturating_sub(1));
        let conn = self.connect_for(start, end)?;
        conn.reset_state()?;
        conn.set_address(start)?;
        conn.reset_state()?;
        let block_size = conn.transfer_size();
        self.upload_start = start;
        Ok(block_size)
    }

    fn upload(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let start = self.upload_start;
        let conn = self.connection()?;
        let block_size = u32::from(conn.transfer_size());
        let block = address
            .checked_sub(start)
            .map(|offset| offset / block_size)
            .and_then(|block| u16::try_from(block).ok())
            .ok_or_else(|| {
                UsbDfuError::InvalidResponse(format!("address 0x{:08X} outside upload", address))
            })?;
        let length = u16::try_from(length)
            .map_err(|_| UsbDfuError::InvalidResponse(format!("block of {} bytes", length)))?;
        conn.upload(block, length)
    }
}

/// Finds a rebooted device by its vendor/product pair
///
/// The device may still answer at its old bus location right after the
/// reboot request. Nothing is reported until that location has been seen
/// empty once.
#[derive(Debug, Clone)]
pub struct UsbRebooting {
    filter: DeviceFilter,
    /// Bus ID and address of the rebooted device until it drops off
    stale: Option<(String, u8)>,
}

impl UsbRebooting {
    fn new(info: &DeviceInfo) -> Self {
        Self {
            filter: DeviceFilter::exact(info.vendor_id, info.product_id),
            stale: Some((info.bus_id.clone(), info.device_address)),
        }
    }

    fn select<T>(&mut self, candidates: Vec<T>, info: impl Fn(&T) -> &DeviceInfo) -> Option<T> {
        if let Some((bus_id, address)) = &self.stale {
            let lingering = candidates.iter().map(&info).any(|i| {
                i.bus_id == *bus_id && i.device_address == *address
            });
            if lingering {
                log::trace!("Rebooted device still at bus {} address {}", bus_id, address);
                return None;
            }
            self.stale = None;
        }
        candidates.into_iter().next()
    }
}

impl Rediscover for UsbRebooting {
    type Device = UsbDfuDevice;
    type Error = UsbDfuError;

    fn rediscover(&mut self) -> Result<Option<UsbDfuDevice>> {
        let devices = find_devices(&self.filter)?;
        Ok(self.select(devices, |d| &d.info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdfu_core::plan::EraseRegion;

    fn info() -> DeviceInfo {
        let intf = |alt, s| InterfaceInfo {
            interface: 0,
            alt_setting: alt,
            layout: parse_memory_layout(s).unwrap(),
        };
        DeviceInfo {
            vendor_id: 0x0483,
            product_id: 0xDF11,
            product_string: "STM32  BOOTLOADER".into(),
            bus_id: "3".into(),
            device_address: 7,
            dfuse: true,
            interfaces: vec![
                intf(0, "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg"),
                intf(1, "@Option Bytes  /0x1FFFC000/01*016 e"),
                intf(2, "@OTP Memory /0x1FFF7800/01*512 a,01*016 a"),
            ],
        }
    }

    #[test]
    fn test_rediscovery_skips_lingering_device() {
        let old = info();
        let mut rebooting = UsbRebooting::new(&old);

        // Still enumerated at the old location: not the rebooted device yet
        assert_eq!(rebooting.select(vec![old.clone()], |i| i), None);
        // Gone from the bus
        assert_eq!(rebooting.select(Vec::<DeviceInfo>::new(), |i| i), None);

        let fresh = DeviceInfo {
            device_address: 8,
            ..old.clone()
        };
        assert_eq!(rebooting.select(vec![fresh.clone()], |i| i), Some(fresh));
        // Once it dropped off, the old address may be reused
        assert_eq!(rebooting.select(vec![old.clone()], |i| i), Some(old));
    }

    #[test]
    fn test_rediscovery_new_address_right_away() {
        let old = info();
        let mut rebooting = UsbRebooting::new(&old);
        let fresh = DeviceInfo {
            device_address: 9,
            ..old.clone()
        };
        assert_eq!(rebooting.select(vec![fresh.clone()], |i| i), Some(fresh));
    }

    #[test]
    fn test_context_for_flash() {
        let ctx = download_context(&info(), 0x0800_0000, 0x0801_7FFF, 2048).unwrap();
        assert_eq!(ctx.max_transfer_size, 2048);
        assert_eq!(
            ctx.regions,
            vec![
                EraseRegion {
                    start: 0x0800_0000,
                    page_size: 0x4000,
                    page_count: 4,
                    erasable: true,
                },
                EraseRegion {
                    start: 0x0801_0000,
                    page_size: 0x10000,
                    page_count: 1,
                    erasable: true,
                },
            ]
        );

        let pages = ctx.plan_erase(0x0800_0000, 0x0801_7FFF).unwrap();
        let addresses: Vec<u32> = pages.iter().map(|p| p.address).collect();
        assert_eq!(
            addresses,
            vec![0x0800_0000, 0x0800_4000, 0x0800_8000, 0x0800_C000, 0x0801_0000]
        );
    }

    #[test]
    fn test_context_default_transfer_size() {
        let ctx = download_context(&info(), 0x0800_0000, 0x0800_00FF, 0).unwrap();
        assert_eq!(ctx.max_transfer_size, crate::DEFAULT_TRANSFER_SIZE);
    }

    #[test]
    fn test_context_picks_matching_interface() {
        let ctx = download_context(&info(), 0x1FFF_C000, 0x1FFF_C00F, 1024).unwrap();
        assert_eq!(ctx.regions.len(), 1);
        assert_eq!(ctx.regions[0].start, 0x1FFF_C000);
        assert!(!ctx.regions[0].erasable);
        // Option bytes are written in place
        assert!(ctx.plan_erase(0x1FFF_C000, 0x1FFF_C00F).unwrap().is_empty());
    }

    #[test]
    fn test_context_read_only_memory_has_no_regions() {
        let ctx = download_context(&info(), 0x1FFF_7800, 0x1FFF_780F, 1024).unwrap();
        assert!(ctx.regions.is_empty());
        assert!(ctx.plan_erase(0x1FFF_7800, 0x1FFF_780F).is_err());
    }

    #[test]
    fn test_context_outside_memory() {
        let err = download_context(&info(), 0x2000_0000, 0x2000_00FF, 2048).unwrap_err();
        assert!(matches!(
            err,
            UsbDfuError::NoMemorySegments {
                start: 0x2000_0000,
                end: 0x2000_00FF
            }
        ));
    }

    #[test]
    fn test_context_past_end_of_flash() {
        assert!(download_context(&info(), 0x080F_FF00, 0x0810_00FF, 2048).is_err());
    }
}

//! rdfu-dummy - In-memory DfuSe device for testing
//!
//! This crate provides a simulated DfuSe bootloader living on a simulated
//! bus. Memory follows the layout string of the device, erases fill pages
//! with `0xFF`, and programming can only clear bits, so an engine that
//! forgets to erase produces visibly wrong contents. Rebooting makes the
//! device vanish from the bus for a configurable number of polls.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use rdfu_core::device::{DeviceFilter, DeviceInfo, DfuDevice, DfuUpload, InterfaceInfo, Rediscover};
use rdfu_core::memory::{parse_memory_layout, MemoryLayout, MemorySegment};
use rdfu_core::plan::DownloadContext;
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Configuration for the dummy device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Product string
    pub product_string: String,
    /// DfuSe memory layout string of the single alternate setting
    pub layout: String,
    /// Largest accepted download/upload
    pub transfer_size: u16,
    /// Failed polls before a rebooted device shows up again; `None` never
    pub reappear_after: Option<usize>,
    /// Identity taken on after each reboot, swapped back on the next one
    pub after_reboot: Option<DummyPersona>,
}

/// Product string and memory layout a device shows on the bus
///
/// Models firmware whose application exposes DFU with a different
/// description than its bootloader. Memory contents are kept by address
/// across the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyPersona {
    /// Product string
    pub product_string: String,
    /// DfuSe memory layout string
    pub layout: String,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0483, // STMicroelectronics
            product_id: 0xDF11,
            product_string: "STM32  BOOTLOADER".to_string(),
            // STM32F405: 4x16K, 1x64K, 7x128K
            layout: "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg".to_string(),
            transfer_size: 2048,
            reappear_after: Some(3),
            after_reboot: None,
        }
    }
}

/// Errors reported by the dummy device
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DummyError {
    /// The layout string did not parse
    #[error("invalid memory layout {0:?}")]
    InvalidLayout(String),

    /// Address outside every segment
    #[error("address 0x{0:08X} is outside device memory")]
    OutOfRange(u32),

    /// No segment covers a download/upload window
    #[error("no memory covers 0x{start:08X}..=0x{end:08X}")]
    NoMemory {
        /// First address
        start: u32,
        /// Last address
        end: u32,
    },

    /// Erase of a segment without the erasable attribute
    #[error("page at 0x{0:08X} cannot be erased")]
    NotErasable(u32),

    /// Erase address is not a page boundary
    #[error("0x{0:08X} is not the start of a page")]
    Unaligned(u32),

    /// Write to a segment without the writable attribute
    #[error("0x{0:08X} is not writable")]
    NotWritable(u32),

    /// Write to flash whose page was never erased
    #[error("write to 0x{0:08X} before its page was erased")]
    NotErased(u32),

    /// Request larger than the transfer size
    #[error("transfer of {len} bytes exceeds the transfer size of {max}")]
    TransferTooLarge {
        /// Requested length
        len: usize,
        /// Transfer size
        max: u16,
    },

    /// The device is not on the bus
    #[error("device disconnected")]
    Disconnected,
}

/// A reboot request seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootRecord {
    /// Where the trigger payload was written
    pub address: u32,
    /// Trigger payload
    pub data: Vec<u8>,
    /// Restart address
    pub reboot_address: u32,
}

struct Bank {
    segment: MemorySegment,
    data: Vec<u8>,
}

impl Bank {
    fn erased(segment: MemorySegment) -> Self {
        Self {
            segment,
            data: vec![0xFF; segment.size() as usize],
        }
    }
}

struct BusState {
    config: DummyConfig,
    info: DeviceInfo,
    banks: Vec<Bank>,
    erased: BTreeSet<u32>,
    erase_log: Vec<u32>,
    reboots: Vec<RebootRecord>,
    present: bool,
    polls_left: Option<usize>,
    left: bool,
    upload_start: u32,
    /// Product string and layout of the other persona
    alternate: Option<(String, MemoryLayout)>,
}

impl BusState {
    fn layout(&self) -> &MemoryLayout {
        &self.info.interfaces[0].layout
    }

    /// Swap in the alternate persona, carrying memory over by address
    fn switch_persona(&mut self) {
        let Some((product_string, layout)) = self.alternate.take() else {
            return;
        };
        let banks = layout
            .segments
            .iter()
            .map(|segment| {
                let mut bank = Bank::erased(*segment);
                for (i, byte) in bank.data.iter_mut().enumerate() {
                    if let Some((old, offset)) = self.locate(segment.start.wrapping_add(i as u32)) {
                        *byte = self.banks[old].data[offset];
                    }
                }
                bank
            })
            .collect();
        self.banks = banks;

        let product_string = std::mem::replace(&mut self.info.product_string, product_string);
        let layout = std::mem::replace(&mut self.info.interfaces[0].layout, layout);
        log::debug!("dummy: now \"{}\"", self.info.product_string);
        self.alternate = Some((product_string, layout));
    }

    fn locate(&self, address: u32) -> Option<(usize, usize)> {
        self.banks.iter().enumerate().find_map(|(i, bank)| {
            let seg = &bank.segment;
            seg.overlaps(address, address)
                .then(|| (i, (address - seg.start) as usize))
        })
    }

    fn page_start(&self, bank: usize, offset: usize) -> u32 {
        let seg = &self.banks[bank].segment;
        seg.start + (offset as u32 / seg.page_size) * seg.page_size
    }

    fn check_present(&self) -> Result<(), DummyError> {
        if self.present {
            Ok(())
        } else {
            Err(DummyError::Disconnected)
        }
    }

    fn check_transfer(&self, len: usize) -> Result<(), DummyError> {
        if len > self.config.transfer_size as usize {
            return Err(DummyError::TransferTooLarge {
                len,
                max: self.config.transfer_size,
            });
        }
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<(), DummyError> {
        let (bank, offset) = self.locate(address).ok_or(DummyError::OutOfRange(address))?;
        let seg = self.banks[bank].segment;
        if !seg.erasable() {
            return Err(DummyError::NotErasable(address));
        }
        if offset % seg.page_size as usize != 0 {
            return Err(DummyError::Unaligned(address));
        }
        let page = offset..offset + seg.page_size as usize;
        self.banks[bank].data[page].fill(0xFF);
        self.erased.insert(address);
        self.erase_log.push(address);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), DummyError> {
        let mut targets = Vec::with_capacity(data.len());
        for i in 0..data.len() {
            let addr = address
                .checked_add(i as u32)
                .ok_or(DummyError::OutOfRange(address))?;
            let (bank, offset) = self.locate(addr).ok_or(DummyError::OutOfRange(addr))?;
            let seg = &self.banks[bank].segment;
            if !seg.writable() {
                return Err(DummyError::NotWritable(addr));
            }
            if seg.erasable() && !self.erased.contains(&self.page_start(bank, offset)) {
                return Err(DummyError::NotErased(addr));
            }
            targets.push((bank, offset));
        }
        // Flash programming can only clear bits
        for ((bank, offset), byte) in targets.into_iter().zip(data) {
            self.banks[bank].data[offset] &= byte;
        }
        Ok(())
    }

    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map_while(|i| {
                let addr = address.checked_add(i as u32)?;
                let (bank, offset) = self.locate(addr)?;
                let bank = &self.banks[bank];
                bank.segment.readable().then(|| bank.data[offset])
            })
            .collect()
    }
}

/// The simulated bus holding one dummy device
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct DummyBus(Rc<RefCell<BusState>>);

impl std::fmt::Debug for DummyBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.borrow();
        f.debug_struct("DummyBus")
            .field("product", &state.info.product_string)
            .field("present", &state.present)
            .field("left", &state.left)
            .finish_non_exhaustive()
    }
}

impl DummyBus {
    /// Put a device in bootloader mode on a new bus
    pub fn new(config: DummyConfig) -> Result<Self, DummyError> {
        let layout = parse_memory_layout(&config.layout)
            .ok_or_else(|| DummyError::InvalidLayout(config.layout.clone()))?;
        let banks = layout.segments.iter().copied().map(Bank::erased).collect();
        let alternate = match &config.after_reboot {
            Some(persona) => {
                let layout = parse_memory_layout(&persona.layout)
                    .ok_or_else(|| DummyError::InvalidLayout(persona.layout.clone()))?;
                Some((persona.product_string.clone(), layout))
            }
            None => None,
        };
        let info = DeviceInfo {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            product_string: config.product_string.clone(),
            bus_id: "dummy".to_string(),
            device_address: 1,
            dfuse: true,
            interfaces: vec![InterfaceInfo {
                interface: 0,
                alt_setting: 0,
                layout,
            }],
        };
        Ok(Self(Rc::new(RefCell::new(BusState {
            config,
            info,
            banks,
            erased: BTreeSet::new(),
            erase_log: Vec::new(),
            reboots: Vec::new(),
            present: true,
            polls_left: None,
            left: false,
            upload_start: 0,
            alternate,
        }))))
    }

    /// Devices on the bus matching `filter`
    pub fn find_devices(&self, filter: &DeviceFilter) -> Vec<DummyDevice> {
        let state = self.0.borrow();
        if !state.present || !filter.matches(state.info.vendor_id, state.info.product_id) {
            return Vec::new();
        }
        vec![DummyDevice {
            bus: self.clone(),
            info: state.info.clone(),
        }]
    }

    /// The device, if it is on the bus
    pub fn device(&self) -> Option<DummyDevice> {
        self.find_devices(&DeviceFilter::any()).into_iter().next()
    }

    /// Store `data` at `address` directly, bypassing erase rules
    pub fn load(&self, address: u32, data: &[u8]) -> Result<(), DummyError> {
        let mut state = self.0.borrow_mut();
        for (i, &byte) in data.iter().enumerate() {
            let addr = address.wrapping_add(i as u32);
            let (bank, offset) = state.locate(addr).ok_or(DummyError::OutOfRange(addr))?;
            state.banks[bank].data[offset] = byte;
        }
        Ok(())
    }

    /// Memory contents; stops early at unmapped or unreadable memory
    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        self.0.borrow().read(address, len)
    }

    /// Erased page addresses, in request order
    pub fn erase_log(&self) -> Vec<u32> {
        self.0.borrow().erase_log.clone()
    }

    /// Reboot requests, in order
    pub fn reboots(&self) -> Vec<RebootRecord> {
        self.0.borrow().reboots.clone()
    }

    /// Whether the device left DFU mode
    pub fn has_left(&self) -> bool {
        self.0.borrow().left
    }

    /// Whether the device currently answers enumeration
    pub fn is_present(&self) -> bool {
        self.0.borrow().present
    }

    /// Current description of the device, present or not
    pub fn info(&self) -> DeviceInfo {
        self.0.borrow().info.clone()
    }
}

/// Handle to the dummy device
#[derive(Debug)]
pub struct DummyDevice {
    bus: DummyBus,
    info: DeviceInfo,
}

impl DummyDevice {
    fn state(&self) -> Result<std::cell::RefMut<'_, BusState>, DummyError> {
        let state = self.bus.0.borrow_mut();
        state.check_present()?;
        Ok(state)
    }
}

impl DfuDevice for DummyDevice {
    type Error = DummyError;
    type Rebooting = DummyRebooting;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn reset_state(&mut self) -> Result<(), DummyError> {
        self.state().map(|_| ())
    }

    fn start_download(&mut self, start: u32, end: u32) -> Result<DownloadContext, DummyError> {
        let state = self.state()?;
        let layout = state.layout();
        if !layout.covers(start, end) {
            return Err(DummyError::NoMemory { start, end });
        }
        Ok(DownloadContext {
            max_transfer_size: state.config.transfer_size,
            regions: layout.erase_regions(start, end),
        })
    }

    fn erase_page(&mut self, address: u32) -> Result<(), DummyError> {
        log::trace!("dummy: erase 0x{:08X}", address);
        self.state()?.erase(address)
    }

    fn download(&mut self, address: u32, data: &[u8]) -> Result<(), DummyError> {
        log::trace!("dummy: download {} bytes at 0x{:08X}", data.len(), address);
        let mut state = self.state()?;
        state.check_transfer(data.len())?;
        state.program(address, data)
    }

    fn reboot(self, address: u32, data: &[u8], reboot_address: u32) -> Result<DummyRebooting, DummyError> {
        let mut state = self.state()?;
        state.check_transfer(data.len())?;
        log::debug!("dummy: reboot to 0x{:08X}", reboot_address);
        state.reboots.push(RebootRecord {
            address,
            data: data.to_vec(),
            reboot_address,
        });
        state.present = false;
        state.polls_left = state.config.reappear_after;
        let filter = DeviceFilter::exact(state.info.vendor_id, state.info.product_id);
        drop(state);
        Ok(DummyRebooting {
            bus: self.bus,
            filter,
        })
    }

    fn leave(self) -> Result<(), DummyError> {
        let mut state = self.state()?;
        state.left = true;
        state.present = false;
        Ok(())
    }
}

impl DfuUpload for DummyDevice {
    fn start_upload(&mut self, start: u32, _length: usize) -> Result<u16, DummyError> {
        let mut state = self.state()?;
        if state.locate(start).is_none() {
            return Err(DummyError::NoMemory { start, end: start });
        }
        state.upload_start = start;
        Ok(state.config.transfer_size)
    }

    fn upload(&mut self, address: u32, length: usize) -> Result<Vec<u8>, DummyError> {
        let state = self.state()?;
        state.check_transfer(length)?;
        if address < state.upload_start {
            return Err(DummyError::OutOfRange(address));
        }
        Ok(state.read(address, length))
    }
}

/// Rediscovery token of a rebooting dummy device
#[derive(Debug)]
pub struct DummyRebooting {
    bus: DummyBus,
    filter: DeviceFilter,
}

impl Rediscover for DummyRebooting {
    type Device = DummyDevice;
    type Error = DummyError;

    fn rediscover(&mut self) -> Result<Option<DummyDevice>, DummyError> {
        {
            let mut state = self.bus.0.borrow_mut();
            if !state.present {
                match state.polls_left {
                    None => return Ok(None),
                    Some(0) => {
                        state.present = true;
                        state.switch_persona();
                    }
                    Some(n) => {
                        state.polls_left = Some(n - 1);
                        return Ok(None);
                    }
                }
            }
        }
        Ok(self.bus.find_devices(&self.filter).into_iter().next())
    }
}

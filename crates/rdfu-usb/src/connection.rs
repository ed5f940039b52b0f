//! DFU requests over a claimed USB interface

use std::time::{Duration, Instant};

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::MaybeFuture;

use crate::error::{Result, UsbDfuError};
use crate::protocol::*;
use crate::{DEFAULT_TIMEOUT, DEFAULT_TRANSFER_SIZE, STATUS_POLL_TIMEOUT};

/// A claimed DFU alternate setting
pub struct DfuConnection {
    interface: nusb::Interface,
    alt_setting: u8,
    transfer_size: u16,
}

impl DfuConnection {
    /// Claim `interface`, select `alt_setting` and wrap it
    ///
    /// A `transfer_size` of zero falls back to [`DEFAULT_TRANSFER_SIZE`].
    pub fn open(
        device: &nusb::Device,
        interface: u8,
        alt_setting: u8,
        transfer_size: u16,
    ) -> Result<Self> {
        let intf = device.claim_interface(interface).wait()?;
        intf.set_alt_setting(alt_setting).wait()?;
        log::debug!(
            "Claimed interface {} alt {} (transfer size {})",
            interface,
            alt_setting,
            transfer_size
        );
        Ok(Self {
            interface: intf,
            alt_setting,
            transfer_size: if transfer_size > 0 {
                transfer_size
            } else {
                DEFAULT_TRANSFER_SIZE
            },
        })
    }

    /// Interface number
    pub fn interface_number(&self) -> u8 {
        self.interface.interface_number()
    }

    /// Selected alternate setting
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    /// Largest payload of a single DNLOAD/UPLOAD
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Clear errors and abort pending operations until the device is idle
    pub fn reset_state(&self) -> Result<()> {
        let mut status = self.get_status()?;
        if !status.is_ok() {
            log::debug!("Clearing status {:#04x}", status.status);
            self.clear_status()?;
            status = self.get_status()?;
        }
        if status.state != DfuState::DfuIdle {
            log::debug!("Aborting from state {}", status.state);
            self.abort()?;
            status = self.get_status()?;
        }
        status.check()
    }

    /// DFU_GETSTATUS
    pub fn get_status(&self) -> Result<DfuStatus> {
        let data = self.request_in(DFU_GETSTATUS, 0, DFU_STATUS_LEN)?;
        DfuStatus::from_bytes(&data)
    }

    /// DFU_CLRSTATUS
    pub fn clear_status(&self) -> Result<()> {
        self.request_out(DFU_CLRSTATUS, 0, &[])
    }

    /// DFU_ABORT
    pub fn abort(&self) -> Result<()> {
        self.request_out(DFU_ABORT, 0, &[])
    }

    /// DfuSe "set address pointer"
    pub fn set_address(&self, address: u32) -> Result<()> {
        self.dnload(0, &dfuse_command(DFUSE_SET_ADDRESS, address))
    }

    /// DfuSe "erase page"
    pub fn erase_page(&self, address: u32) -> Result<()> {
        self.dnload(0, &dfuse_command(DFUSE_ERASE, address))
    }

    /// Write `data` at `address`
    pub fn download(&self, address: u32, data: &[u8]) -> Result<()> {
        self.set_address(address)?;
        self.dnload(DFUSE_DATA_BLOCK, data)
    }

    /// Read block `block` relative to the last address set
    pub fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>> {
        self.request_in(DFU_UPLOAD, DFUSE_DATA_BLOCK + block, length)
    }

    /// Write `data`, then jump to `reboot_address`
    ///
    /// The device usually disconnects while processing the final request,
    /// so its outcome is ignored.
    pub fn reboot(&self, address: u32, data: &[u8], reboot_address: u32) -> Result<()> {
        self.download(address, data)?;
        self.set_address(reboot_address)?;
        if let Err(e) = self.dnload(0, &[]) {
            log::debug!("Ignoring error from reboot request: {}", e);
        }
        Ok(())
    }

    /// Leave DFU mode and start the application
    pub fn leave(&self) -> Result<()> {
        if let Err(e) = self.dnload(0, &[]) {
            log::debug!("Ignoring error from leave request: {}", e);
        }
        Ok(())
    }

    fn dnload(&self, block: u16, data: &[u8]) -> Result<()> {
        self.request_out(DFU_DNLOAD, block, data)?;
        self.poll_until_idle()
    }

    /// Poll DFU_GETSTATUS, honouring bwPollTimeout, until dfuDNLOAD-IDLE
    fn poll_until_idle(&self) -> Result<()> {
        let deadline = Instant::now() + STATUS_POLL_TIMEOUT;
        loop {
            let status = self.get_status()?;
            status.check()?;
            if status.state == DfuState::DownloadIdle {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Device stuck in {}", status.state);
                return Err(UsbDfuError::Timeout);
            }
            let wait = status.poll_timeout.min(deadline - now);
            if wait > Duration::ZERO {
                std::thread::sleep(wait);
            }
        }
    }

    fn request_out(&self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        let index = u16::from(self.interface.interface_number());
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?;
        Ok(())
    }

    fn request_in(&self, request: u8, value: u16, length: u16) -> Result<Vec<u8>> {
        let index = u16::from(self.interface.interface_number());
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }
}

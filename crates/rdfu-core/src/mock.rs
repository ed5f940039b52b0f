//! Test doubles for the flashing engine

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::device::{DeviceInfo, DfuDevice, DfuUpload, InterfaceInfo, Rediscover};
use crate::memory::{MemoryLayout, MemorySegment, SegmentFlags};
use crate::plan::DownloadContext;
use crate::progress::FlashProgress;
use crate::reboot::Clock;

/// A request seen by the mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    ResetState,
    StartDownload(u32, u32),
    Erase(u32),
    Download(u32, usize),
    /// (address, trigger length, reboot address)
    Reboot(u32, usize, u32),
    Poll,
    Leave,
    StartUpload(u32, usize),
    Upload(u32, usize),
}

#[derive(Debug, Error)]
#[error("mock failure: {0}")]
pub(crate) struct MockError(&'static str);

#[derive(Debug, Default)]
struct Faults {
    erase_at: Option<u32>,
    download_at: Option<u32>,
    short_upload_at: Option<u32>,
    reboot: bool,
    /// Polls answering with an error before any other answer
    poll_errors: u32,
    /// Poll number at which the device reappears; never when `None`
    reappear_after: Option<u32>,
}

/// Records every request; clones of the state survive reboots
#[derive(Debug)]
pub(crate) struct MockDevice {
    info: DeviceInfo,
    ctx: DownloadContext,
    ops: Rc<RefCell<Vec<Op>>>,
    faults: Rc<RefCell<Faults>>,
}

impl MockDevice {
    pub(crate) fn new(ctx: DownloadContext) -> Self {
        let segments = ctx
            .regions
            .iter()
            .map(|r| MemorySegment {
                start: r.start,
                page_size: r.page_size,
                page_count: r.page_count,
                flags: SegmentFlags::all(),
            })
            .collect();
        let info = DeviceInfo {
            vendor_id: 0x0483,
            product_id: 0xDF11,
            product_string: "Mock DFU".into(),
            bus_id: "0".into(),
            device_address: 1,
            dfuse: true,
            interfaces: vec![InterfaceInfo {
                interface: 0,
                alt_setting: 0,
                layout: MemoryLayout {
                    name: "Internal Flash".into(),
                    segments,
                },
            }],
        };
        Self {
            info,
            ctx,
            ops: Rc::new(RefCell::new(Vec::new())),
            faults: Rc::new(RefCell::new(Faults::default())),
        }
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.ops.borrow().clone()
    }

    /// Handle on the op log that outlives the device
    pub(crate) fn shared_ops(&self) -> Rc<RefCell<Vec<Op>>> {
        Rc::clone(&self.ops)
    }

    pub(crate) fn fail_erase_at(&self, address: u32) {
        self.faults.borrow_mut().erase_at = Some(address);
    }

    pub(crate) fn fail_download_at(&self, address: u32) {
        self.faults.borrow_mut().download_at = Some(address);
    }

    pub(crate) fn short_upload_at(&self, address: u32) {
        self.faults.borrow_mut().short_upload_at = Some(address);
    }

    pub(crate) fn fail_reboot(&self) {
        self.faults.borrow_mut().reboot = true;
    }

    pub(crate) fn poll_errors(&self, count: u32) {
        self.faults.borrow_mut().poll_errors = count;
    }

    pub(crate) fn reappear_after(&self, polls: u32) {
        self.faults.borrow_mut().reappear_after = Some(polls);
    }

    fn record(&self, op: Op) {
        self.ops.borrow_mut().push(op);
    }
}

impl DfuDevice for MockDevice {
    type Error = MockError;
    type Rebooting = MockRebooting;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn reset_state(&mut self) -> Result<(), MockError> {
        self.record(Op::ResetState);
        Ok(())
    }

    fn start_download(&mut self, start: u32, end: u32) -> Result<DownloadContext, MockError> {
        self.record(Op::StartDownload(start, end));
        Ok(self.ctx.clone())
    }

    fn erase_page(&mut self, address: u32) -> Result<(), MockError> {
        self.record(Op::Erase(address));
        if self.faults.borrow().erase_at == Some(address) {
            return Err(MockError("erase"));
        }
        Ok(())
    }

    fn download(&mut self, address: u32, data: &[u8]) -> Result<(), MockError> {
        self.record(Op::Download(address, data.len()));
        if self.faults.borrow().download_at == Some(address) {
            return Err(MockError("download"));
        }
        Ok(())
    }

    fn reboot(self, address: u32, data: &[u8], reboot_address: u32) -> Result<MockRebooting, MockError> {
        if self.faults.borrow().reboot {
            return Err(MockError("reboot"));
        }
        self.record(Op::Reboot(address, data.len(), reboot_address));
        Ok(MockRebooting {
            device: Some(self),
            polls: 0,
        })
    }

    fn leave(self) -> Result<(), MockError> {
        self.record(Op::Leave);
        Ok(())
    }
}

impl DfuUpload for MockDevice {
    fn start_upload(&mut self, start: u32, length: usize) -> Result<u16, MockError> {
        self.record(Op::StartUpload(start, length));
        Ok(self.ctx.max_transfer_size)
    }

    fn upload(&mut self, address: u32, length: usize) -> Result<Vec<u8>, MockError> {
        self.record(Op::Upload(address, length));
        let length = if self.faults.borrow().short_upload_at == Some(address) {
            length / 2
        } else {
            length
        };
        Ok((0..length)
            .map(|i| address.wrapping_add(i as u32) as u8)
            .collect())
    }
}

#[derive(Debug)]
pub(crate) struct MockRebooting {
    device: Option<MockDevice>,
    polls: u32,
}

impl Rediscover for MockRebooting {
    type Device = MockDevice;
    type Error = MockError;

    fn rediscover(&mut self) -> Result<Option<MockDevice>, MockError> {
        let Some(device) = self.device.as_ref() else {
            return Ok(None);
        };
        device.record(Op::Poll);
        self.polls += 1;

        let (errors, reappear) = {
            let faults = device.faults.borrow();
            (faults.poll_errors, faults.reappear_after)
        };
        if self.polls <= errors {
            return Err(MockError("poll"));
        }
        if reappear.is_some_and(|n| self.polls >= n) {
            return Ok(self.device.take());
        }
        Ok(None)
    }
}

/// Clock that only moves when slept on
pub(crate) struct FakeClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl FakeClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.offset.set(self.offset.get() + duration);
    }
}

/// Progress reporter keeping every callback
#[derive(Default)]
pub(crate) struct RecordingProgress {
    pub(crate) erase: Vec<(usize, usize)>,
    pub(crate) download: Vec<(usize, usize)>,
    pub(crate) read: Vec<(usize, usize)>,
    pub(crate) reboots: Vec<u32>,
    pub(crate) reconnects: usize,
}

impl FlashProgress for RecordingProgress {
    fn erasing(&mut self, _start: u32, _pages: usize) {}

    fn erase_progress(&mut self, pages_done: usize, pages_total: usize) {
        self.erase.push((pages_done, pages_total));
    }

    fn downloading(&mut self, _start: u32, _bytes: usize) {}

    fn download_progress(&mut self, bytes_done: usize, bytes_total: usize) {
        self.download.push((bytes_done, bytes_total));
    }

    fn rebooting(&mut self, reboot_address: u32) {
        self.reboots.push(reboot_address);
    }

    fn reconnected(&mut self) {
        self.reconnects += 1;
    }

    fn reading(&mut self, _start: u32, _bytes: usize) {}

    fn read_progress(&mut self, bytes_done: usize, bytes_total: usize) {
        self.read.push((bytes_done, bytes_total));
    }
}

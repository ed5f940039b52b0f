//! Progress reporting
//!
//! Callbacks are purely observational: they cannot fail and cannot stop a
//! run.

/// Progress callback for flashing and reading
pub trait FlashProgress {
    /// Called before erasing the pages of a range
    fn erasing(&mut self, start: u32, pages: usize);

    /// Called after each page is erased
    fn erase_progress(&mut self, pages_done: usize, pages_total: usize);

    /// Called before the first transfer of a range
    fn downloading(&mut self, start: u32, bytes: usize);

    /// Called after each transfer
    fn download_progress(&mut self, bytes_done: usize, bytes_total: usize);

    /// Called when the device is told to reboot
    fn rebooting(&mut self, reboot_address: u32);

    /// Called once the device is back after a reboot
    fn reconnected(&mut self);

    /// Called before reading memory back
    fn reading(&mut self, start: u32, bytes: usize);

    /// Called after each block is read
    fn read_progress(&mut self, bytes_done: usize, bytes_total: usize);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn erasing(&mut self, _start: u32, _pages: usize) {}
    fn erase_progress(&mut self, _pages_done: usize, _pages_total: usize) {}
    fn downloading(&mut self, _start: u32, _bytes: usize) {}
    fn download_progress(&mut self, _bytes_done: usize, _bytes_total: usize) {}
    fn rebooting(&mut self, _reboot_address: u32) {}
    fn reconnected(&mut self) {}
    fn reading(&mut self, _start: u32, _bytes: usize) {}
    fn read_progress(&mut self, _bytes_done: usize, _bytes_total: usize) {}
}

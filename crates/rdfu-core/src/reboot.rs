//! Reboot and rediscovery
//!
//! Some images switch the device between bootloader and application
//! mid-flash. The device is told to reboot, drops off the bus and comes
//! back as a new USB device. [`RebootController`] drives that sequence:
//!
//! ```text
//! Idle -> RebootIssued -> Polling -> Found
//!                                 -> TimedOut
//! ```
//!
//! The deadline is computed once when polling starts. Every iteration
//! polls exactly once and sleeps a fixed interval between polls, so the
//! loop is fully deterministic under a test [`Clock`].

use std::time::{Duration, Instant};

use crate::device::{DfuDevice, Rediscover};
use crate::error::{Error, Result};
use crate::progress::FlashProgress;

/// Default time allowed for the device to come back
pub const DEFAULT_REDISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Source of time for the polling loop
pub trait Clock {
    /// Current instant
    fn now(&self) -> Instant;

    /// Block for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Rediscovery timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RediscoveryConfig {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
}

impl Default for RediscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REDISCOVERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Where the controller is in the reboot sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootState {
    /// Nothing sent yet
    Idle,
    /// The reboot command was accepted
    RebootIssued,
    /// Waiting for the device to come back
    Polling {
        /// Polls made so far
        polls: u32,
    },
    /// The device is back
    Found,
    /// The deadline passed
    TimedOut,
}

/// Drives one reboot and the wait for the device to return
pub struct RebootController<'c, C: Clock + ?Sized> {
    config: RediscoveryConfig,
    clock: &'c C,
    state: RebootState,
}

impl<'c, C: Clock + ?Sized> RebootController<'c, C> {
    /// Create a controller in the `Idle` state
    pub fn new(config: RediscoveryConfig, clock: &'c C) -> Self {
        Self {
            config,
            clock,
            state: RebootState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> RebootState {
        self.state
    }

    fn transition(&mut self, state: RebootState) {
        log::trace!("Reboot state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Reboot `device` and wait for it to reappear
    ///
    /// `trigger` is written at `address` before the device is restarted at
    /// `reboot_address`. Returns the new handle.
    pub fn run<D: DfuDevice>(
        &mut self,
        device: D,
        address: u32,
        trigger: &[u8],
        reboot_address: u32,
        progress: &mut dyn FlashProgress,
    ) -> Result<D> {
        log::info!("Rebooting device to 0x{:08X}", reboot_address);
        progress.rebooting(reboot_address);

        let rebooting = device
            .reboot(address, trigger, reboot_address)
            .map_err(Error::device("reboot"))?;
        self.transition(RebootState::RebootIssued);

        let device = self.poll(rebooting)?;
        progress.reconnected();
        Ok(device)
    }

    /// Poll until the device is found or the deadline passes
    pub fn poll<R: Rediscover>(&mut self, mut token: R) -> Result<R::Device> {
        let deadline = self.clock.now() + self.config.timeout;
        let mut polls = 0;
        self.transition(RebootState::Polling { polls });

        loop {
            polls += 1;
            self.state = RebootState::Polling { polls };
            match token.rediscover() {
                Ok(Some(device)) => {
                    log::info!("Device reconnected after {} poll(s)", polls);
                    self.transition(RebootState::Found);
                    return Ok(device);
                }
                Ok(None) => {}
                // The bus is in flux while the device re-enumerates
                Err(e) => log::debug!("Rediscovery poll failed: {}", e),
            }

            if self.clock.now() >= deadline {
                self.transition(RebootState::TimedOut);
                return Err(Error::RediscoveryTimeout(self.config.timeout));
            }
            self.clock.sleep(self.config.poll_interval);
        }
    }
}

/// Reboot `device` and wait for it with the given timing
pub fn reboot_and_wait<D: DfuDevice, C: Clock + ?Sized>(
    device: D,
    address: u32,
    trigger: &[u8],
    reboot_address: u32,
    config: RediscoveryConfig,
    clock: &C,
    progress: &mut dyn FlashProgress,
) -> Result<D> {
    RebootController::new(config, clock).run(device, address, trigger, reboot_address, progress)
}

//! Whole-image flashing
//!
//! [`flash`] validates the image, resets the device, flashes every range in
//! file order (rebooting where the image asks for it) and finally leaves DFU
//! mode.

use crate::device::DfuDevice;
use crate::error::{Error, Result};
use crate::image::{open_image, AddressRange, RangeSource};
use crate::progress::FlashProgress;
use crate::reboot::{Clock, RebootController, RediscoveryConfig};
use crate::session::FlashSession;

/// Options for a flashing run
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOptions {
    /// Start address for plain binaries; the device default when `None`
    pub start_address: Option<u32>,
    /// Reboot rediscovery timing
    pub rediscovery: RediscoveryConfig,
}

/// Summary of a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    /// Ranges erased and programmed
    pub ranges: usize,
    /// Payload bytes downloaded
    pub bytes: usize,
    /// Reboots performed
    pub reboots: usize,
}

/// Collect every range of `source`, stopping at the first malformed one
///
/// Nothing touches the device before the whole image has been decoded.
pub fn validate<'a>(source: &dyn RangeSource<'a>) -> Result<Vec<AddressRange<'a>>> {
    let ranges = source
        .ranges()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    log::debug!("{} image: {} range(s)", source.format(), ranges.len());
    Ok(ranges)
}

/// Flash `image` onto `device`
///
/// The device handle is consumed: it is either replaced by reboots or
/// released by the final leave request.
pub fn flash<D, C>(
    device: D,
    image: &[u8],
    options: &FlashOptions,
    clock: &C,
    progress: &mut dyn FlashProgress,
) -> Result<FlashStats>
where
    D: DfuDevice,
    C: Clock + ?Sized,
{
    let start = options
        .start_address
        .or_else(|| device.default_start_address());
    let source = open_image(image, start)?;
    let ranges = validate(source.as_ref())?;
    flash_ranges(device, &ranges, options, clock, progress)
}

/// Flash already decoded ranges onto `device`
pub fn flash_ranges<D, C>(
    mut device: D,
    ranges: &[AddressRange<'_>],
    options: &FlashOptions,
    clock: &C,
    progress: &mut dyn FlashProgress,
) -> Result<FlashStats>
where
    D: DfuDevice,
    C: Clock + ?Sized,
{
    let mut stats = FlashStats::default();

    log::info!("Resetting device state");
    device.reset_state().map_err(Error::device("reset state"))?;

    for range in ranges {
        match range.reboot_address {
            Some(reboot_address) => {
                let mut controller = RebootController::new(options.rediscovery, clock);
                device = controller.run(
                    device,
                    range.start_address,
                    &range.payload,
                    reboot_address,
                    progress,
                )?;
                stats.reboots += 1;
            }
            None => {
                let mut session = FlashSession::new(range);
                session.run(&mut device, progress)?;
                stats.ranges += 1;
                stats.bytes += session.bytes_done();
            }
        }
    }

    log::info!("Leaving DFU mode");
    device.leave().map_err(Error::device("leave"))?;
    Ok(stats)
}

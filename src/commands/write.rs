//! Write command implementation

use rdfu_core::flash::{self, FlashOptions, FlashStats};
use rdfu_core::progress::FlashProgress;
use rdfu_core::reboot::Clock;
use rdfu_core::DfuDevice;

/// Flash `image` (raw binary or UF2) onto `device`
pub fn run<D, C>(
    device: D,
    image: &[u8],
    options: &FlashOptions,
    clock: &C,
    progress: &mut dyn FlashProgress,
) -> Result<FlashStats, Box<dyn std::error::Error>>
where
    D: DfuDevice,
    C: Clock + ?Sized,
{
    let stats = flash::flash(device, image, options, clock, progress)?;
    println!(
        "Wrote {} bytes in {} range(s), {} reboot(s)",
        stats.bytes, stats.ranges, stats.reboots
    );
    Ok(stats)
}

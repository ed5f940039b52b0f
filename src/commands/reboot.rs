//! Reboot command implementation

use rdfu_core::progress::FlashProgress;
use rdfu_core::reboot::{reboot_and_wait, Clock, RediscoveryConfig};
use rdfu_core::{DfuDevice, Error};

/// Trigger understood by bootloaders that stay in DFU mode after a restart
pub const REBOOT_TRIGGER: &[u8] = b"BDFU";

/// Write the reboot trigger at `address`, restart at `start` and wait
///
/// Returns the reconnected device, already reset to the idle state.
pub fn run<D, C>(
    device: D,
    address: u32,
    start: u32,
    config: RediscoveryConfig,
    clock: &C,
    progress: &mut dyn FlashProgress,
) -> Result<D, Box<dyn std::error::Error>>
where
    D: DfuDevice,
    C: Clock + ?Sized,
{
    let began = clock.now();
    let mut device = reboot_and_wait(device, address, REBOOT_TRIGGER, start, config, clock, progress)?;
    device.reset_state().map_err(Error::device("reset state"))?;
    println!("Reconnected in {:?}", clock.now().duration_since(began));
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdfu_core::progress::NoProgress;
    use rdfu_core::reboot::SystemClock;
    use rdfu_dummy::{DummyBus, DummyConfig, RebootRecord};
    use std::time::Duration;

    fn config() -> RediscoveryConfig {
        RediscoveryConfig {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_reboot_and_reconnect() {
        let bus = DummyBus::new(DummyConfig::default()).unwrap();

        let device = run(
            bus.device().unwrap(),
            0x2001_FFF0,
            0x0800_0000,
            config(),
            &SystemClock,
            &mut NoProgress,
        )
        .unwrap();

        assert_eq!(device.info().vendor_id, 0x0483);
        assert_eq!(
            bus.reboots(),
            vec![RebootRecord {
                address: 0x2001_FFF0,
                data: b"BDFU".to_vec(),
                reboot_address: 0x0800_0000,
            }]
        );
        assert!(bus.is_present());
    }

    #[test]
    fn test_reboot_never_returns() {
        let bus = DummyBus::new(DummyConfig {
            reappear_after: None,
            ..DummyConfig::default()
        })
        .unwrap();
        let config = RediscoveryConfig {
            timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
        };

        let err = run(
            bus.device().unwrap(),
            0x2001_FFF0,
            0x0800_0000,
            config,
            &SystemClock,
            &mut NoProgress,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("device did not reappear"));
    }
}

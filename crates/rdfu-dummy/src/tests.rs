use std::cell::Cell;
use std::time::{Duration, Instant};

use rdfu_core::flash::{flash, FlashOptions, FlashStats};
use rdfu_core::image::builder::{build_uf2, BlockBuilder};
use rdfu_core::image::uf2::BLOCK_SIZE;
use rdfu_core::progress::NoProgress;
use rdfu_core::read::read_memory;
use rdfu_core::reboot::{Clock, RediscoveryConfig};
use rdfu_core::Error;

use super::*;

/// Clock that advances only when slept on
struct StepClock {
    now: Cell<Instant>,
}

impl StepClock {
    fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

fn bus() -> DummyBus {
    DummyBus::new(DummyConfig::default()).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

/// (address, payload, reboot address) triples to a UF2 file
fn uf2(blocks: &[(u32, &[u8], Option<u32>)]) -> Vec<u8> {
    let blocks: Vec<BlockBuilder> = blocks
        .iter()
        .map(|&(addr, payload, reboot)| match reboot {
            Some(reboot_address) => BlockBuilder::reboot(addr, payload, reboot_address),
            None => BlockBuilder::new(addr, payload),
        })
        .collect();
    build_uf2(&blocks)
}

fn fast_rediscovery(timeout: Duration) -> FlashOptions {
    FlashOptions {
        start_address: None,
        rediscovery: RediscoveryConfig {
            timeout,
            poll_interval: Duration::from_millis(100),
        },
    }
}

#[test]
fn test_flash_plain_binary() {
    let bus = bus();
    let image = pattern(5000, 1);

    let stats = flash(
        bus.device().unwrap(),
        &image,
        &FlashOptions::default(),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(
        stats,
        FlashStats {
            ranges: 1,
            bytes: 5000,
            reboots: 0
        }
    );
    assert_eq!(bus.read(0x0800_0000, 5000), image);
    assert_eq!(bus.read(0x0800_0000 + 5000, 4), vec![0xFF; 4]);
    assert_eq!(bus.erase_log(), vec![0x0800_0000]);
    assert!(bus.has_left());
    assert!(!bus.is_present());
}

#[test]
fn test_flash_erases_stale_contents() {
    let bus = bus();
    bus.load(0x0800_0000, &[0u8; 64]).unwrap();
    let image = pattern(64, 0x80);

    flash(
        bus.device().unwrap(),
        &image,
        &FlashOptions::default(),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(bus.read(0x0800_0000, 64), image);
}

#[test]
fn test_flash_across_page_sizes() {
    let bus = bus();
    let image = pattern(70_000, 3);
    let options = FlashOptions {
        start_address: Some(0x0801_0000),
        ..FlashOptions::default()
    };

    flash(bus.device().unwrap(), &image, &options, &StepClock::new(), &mut NoProgress).unwrap();

    assert_eq!(bus.erase_log(), vec![0x0801_0000, 0x0802_0000]);
    assert_eq!(bus.read(0x0801_0000, image.len()), image);
}

#[test]
fn test_flash_small_transfer_size() {
    let bus = DummyBus::new(DummyConfig {
        transfer_size: 64,
        ..DummyConfig::default()
    })
    .unwrap();
    let image = pattern(1000, 9);

    flash(
        bus.device().unwrap(),
        &image,
        &FlashOptions::default(),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(bus.read(0x0800_0000, 1000), image);
}

#[test]
fn test_flash_outside_memory() {
    let bus = bus();
    let options = FlashOptions {
        start_address: Some(0x080F_FF00),
        ..FlashOptions::default()
    };

    let err = flash(
        bus.device().unwrap(),
        &[0u8; 512],
        &options,
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap_err();

    assert!(matches!(err, Error::Device { stage: "start download", .. }));
    assert!(bus.erase_log().is_empty());
    assert!(!bus.has_left());
}

#[test]
fn test_flash_uf2_with_reboot() {
    let bus = bus();
    let first = pattern(512, 0x10);
    let second = pattern(256, 0x20);
    let image = uf2(&[
        (0x0800_0000, &first[..256], None),
        (0x0800_0100, &first[256..], None),
        (0x2000_0000, b"BDFU", Some(0x0800_0000)),
        (0x0802_0000, &second, None),
    ]);

    let stats = flash(
        bus.device().unwrap(),
        &image,
        &fast_rediscovery(Duration::from_secs(5)),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(
        stats,
        FlashStats {
            ranges: 2,
            bytes: 768,
            reboots: 1
        }
    );
    assert_eq!(
        bus.reboots(),
        vec![RebootRecord {
            address: 0x2000_0000,
            data: b"BDFU".to_vec(),
            reboot_address: 0x0800_0000,
        }]
    );
    assert_eq!(bus.erase_log(), vec![0x0800_0000, 0x0802_0000]);
    assert_eq!(bus.read(0x0800_0000, 512), first);
    assert_eq!(bus.read(0x0802_0000, 256), second);
    assert!(bus.has_left());
}

#[test]
fn test_flash_uf2_rediscovery_timeout() {
    let bus = DummyBus::new(DummyConfig {
        reappear_after: None,
        ..DummyConfig::default()
    })
    .unwrap();
    let first = pattern(256, 0x30);
    let image = uf2(&[
        (0x0800_0000, &first, None),
        (0x2000_0000, b"BDFU", Some(0x0800_0000)),
        (0x0802_0000, &[0u8; 256], None),
    ]);

    let err = flash(
        bus.device().unwrap(),
        &image,
        &fast_rediscovery(Duration::from_secs(1)),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap_err();

    assert!(matches!(err, Error::RediscoveryTimeout(t) if t == Duration::from_secs(1)));
    assert_eq!(bus.read(0x0800_0000, 256), first);
    assert_eq!(bus.erase_log(), vec![0x0800_0000]);
    assert!(!bus.has_left());
}

#[test]
fn test_malformed_uf2_touches_nothing() {
    let bus = bus();
    let mut image = uf2(&[(0x0800_0000, &[1u8; 256], None), (0x0800_0100, &[2u8; 256], None)]);
    image.truncate(BLOCK_SIZE + 100);

    let err = flash(
        bus.device().unwrap(),
        &image,
        &FlashOptions::default(),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap_err();

    assert!(matches!(err, Error::MalformedImage(_)));
    assert!(bus.erase_log().is_empty());
    assert_eq!(bus.read(0x0800_0000, 4), vec![0xFF; 4]);
}

#[test]
fn test_read_back() {
    let bus = bus();
    let data = pattern(5000, 0x42);
    bus.load(0x0800_1000, &data).unwrap();

    let mut device = bus.device().unwrap();
    let read = read_memory(&mut device, 0x0800_1000, data.len(), &mut NoProgress).unwrap();
    assert_eq!(read, data);
}

#[test]
fn test_read_past_end() {
    let bus = bus();
    let mut device = bus.device().unwrap();

    let err = read_memory(&mut device, 0x080F_FF00, 0x200, &mut NoProgress).unwrap_err();
    assert!(matches!(err, Error::TransferFailure { address: 0x080F_FF00, .. }));
}

#[test]
fn test_program_requires_erase() {
    let bus = bus();
    let mut device = bus.device().unwrap();

    assert_eq!(
        device.download(0x0800_0000, &[0x12]),
        Err(DummyError::NotErased(0x0800_0000))
    );
    assert_eq!(
        device.erase_page(0x0800_0100),
        Err(DummyError::Unaligned(0x0800_0100))
    );
    device.erase_page(0x0800_0000).unwrap();
    device.download(0x0800_0000, &[0xF0]).unwrap();
    device.download(0x0800_0000, &[0x3C]).unwrap();
    assert_eq!(bus.read(0x0800_0000, 1), vec![0x30]);
}

#[test]
fn test_transfer_size_enforced() {
    let bus = bus();
    let mut device = bus.device().unwrap();
    device.erase_page(0x0800_0000).unwrap();

    assert_eq!(
        device.download(0x0800_0000, &[0u8; 2049]),
        Err(DummyError::TransferTooLarge { len: 2049, max: 2048 })
    );
}

#[test]
fn test_read_only_segment() {
    let bus = DummyBus::new(DummyConfig {
        layout: "@Option Bytes  /0x1FFFC000/01*016 a".to_string(),
        ..DummyConfig::default()
    })
    .unwrap();
    let mut device = bus.device().unwrap();

    assert_eq!(
        device.erase_page(0x1FFF_C000),
        Err(DummyError::NotErasable(0x1FFF_C000))
    );
    assert_eq!(
        device.download(0x1FFF_C000, &[0]),
        Err(DummyError::NotWritable(0x1FFF_C000))
    );
}

#[test]
fn test_rediscovery_after_polls() {
    let bus = bus();
    let device = bus.device().unwrap();

    let mut token = device.reboot(0x2000_0000, b"BDFU", 0x0800_0000).unwrap();
    assert!(bus.device().is_none());
    for _ in 0..3 {
        assert!(token.rediscover().unwrap().is_none());
    }
    let device = token.rediscover().unwrap().unwrap();
    assert_eq!(device.info().product_id, 0xDF11);
    assert!(bus.is_present());
}

#[test]
fn test_filter_mismatch() {
    let bus = bus();
    assert!(bus.find_devices(&DeviceFilter::exact(0x1209, 0x0001)).is_empty());
    assert_eq!(bus.find_devices(&DeviceFilter::exact(0x0483, 0xDF11)).len(), 1);
}

#[test]
fn test_invalid_layout() {
    let err = DummyBus::new(DummyConfig {
        layout: "nonsense".to_string(),
        ..DummyConfig::default()
    })
    .err()
    .unwrap();
    assert_eq!(err, DummyError::InvalidLayout("nonsense".to_string()));
}

#[test]
fn test_flash_option_bytes_without_erase() {
    let bus = DummyBus::new(DummyConfig {
        layout: "@Option Bytes /0x1FFFC000/01*016 e".to_string(),
        ..DummyConfig::default()
    })
    .unwrap();
    let options = FlashOptions {
        start_address: Some(0x1FFF_C000),
        ..FlashOptions::default()
    };
    let bytes = pattern(16, 0x5A);

    let stats = flash(
        bus.device().unwrap(),
        &bytes,
        &options,
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(stats.bytes, 16);
    assert!(bus.erase_log().is_empty());
    assert_eq!(bus.read(0x1FFF_C000, 16), bytes);
    assert!(bus.has_left());
}

fn bootloader_and_application() -> DummyBus {
    DummyBus::new(DummyConfig {
        product_string: "Radio Bootloader".to_string(),
        after_reboot: Some(DummyPersona {
            product_string: "Radio".to_string(),
            layout: "@Application /0x08020000/07*128Kg".to_string(),
        }),
        ..DummyConfig::default()
    })
    .unwrap()
}

#[test]
fn test_flash_uf2_reboot_into_application() {
    let bus = bootloader_and_application();
    let bootloader = pattern(256, 0x01);
    let application = pattern(256, 0x02);
    let image = uf2(&[
        (0x0800_0000, &bootloader, None),
        (0x2000_0000, b"BDFU", Some(0x0802_0000)),
        (0x0802_0000, &application, None),
    ]);

    flash(
        bus.device().unwrap(),
        &image,
        &fast_rediscovery(Duration::from_secs(5)),
        &StepClock::new(),
        &mut NoProgress,
    )
    .unwrap();

    let info = bus.info();
    assert_eq!(info.product_string, "Radio");
    assert_eq!(info.interfaces[0].name(), "Application");
    assert_eq!(bus.read(0x0802_0000, 256), application);
    // Bootloader flash is no longer mapped
    assert!(bus.read(0x0800_0000, 4).is_empty());
    assert_eq!(bus.erase_log(), vec![0x0800_0000, 0x0802_0000]);
}

#[test]
fn test_persona_swaps_back_and_keeps_memory() {
    let bus = bootloader_and_application();
    bus.load(0x0802_0000, &[1, 2, 3, 4]).unwrap();

    let mut token = bus.device().unwrap().reboot(0x2000_0000, b"BDFU", 0x0802_0000).unwrap();
    let app = loop {
        if let Some(device) = token.rediscover().unwrap() {
            break device;
        }
    };
    assert_eq!(app.info().product_string, "Radio");
    assert_eq!(bus.read(0x0802_0000, 4), vec![1, 2, 3, 4]);

    let mut token = app.reboot(0x2000_0000, b"BDFU", 0x0800_0000).unwrap();
    let bootloader = loop {
        if let Some(device) = token.rediscover().unwrap() {
            break device;
        }
    };
    assert_eq!(bootloader.info().product_string, "Radio Bootloader");
    assert_eq!(bus.read(0x0802_0000, 4), vec![1, 2, 3, 4]);
    assert_eq!(bus.read(0x0800_0000, 2), vec![0xFF, 0xFF]);
}

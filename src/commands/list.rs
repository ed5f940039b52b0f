//! List command implementation

use rdfu_core::memory::MemorySegment;
use rdfu_core::{DeviceFilter, DeviceInfo, DfuDevice};

/// List all DFU devices matching `filter`
pub fn run(filter: &DeviceFilter) -> Result<(), Box<dyn std::error::Error>> {
    let devices = rdfu_usb::find_devices(filter)?;
    if devices.is_empty() {
        println!("No DFU device found");
        return Err(rdfu_core::Error::NoDeviceFound.into());
    }
    for device in &devices {
        print!("{}", format_device(device.info()));
    }
    Ok(())
}

/// One line per device, interface and memory segment
pub fn format_device(info: &DeviceInfo) -> String {
    let mut out = format!(
        "Bus {} Device {:03}: ID {:04x}:{:04x} (dfuse={})\n",
        info.bus_id, info.device_address, info.vendor_id, info.product_id, info.dfuse
    );
    for intf in &info.interfaces {
        out.push_str(&format!(
            "  {} (intf={}, alt={}):\n",
            intf.name(),
            intf.interface,
            intf.alt_setting
        ));
        for segment in &intf.layout.segments {
            out.push_str("    ");
            out.push_str(&format_segment(segment));
            out.push('\n');
        }
    }
    out
}

/// e.g. `0x08000000  4 pages of   16K bytes (rwe)`
pub fn format_segment(segment: &MemorySegment) -> String {
    let (size, unit) = if segment.page_size >= 1024 {
        (segment.page_size / 1024, "K")
    } else {
        (segment.page_size, " ")
    };
    format!(
        "0x{:08X} {:2} pages of {:4}{} bytes ({}{}{})",
        segment.start,
        segment.page_count,
        size,
        unit,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    )
}

//! UF2 inspection

use rdfu_core::image::uf2::{is_uf2, Uf2Image};
use rdfu_core::image::RangeSource;

use super::CommandError;

/// Describe a UF2 file: device and version strings, then every range
pub fn describe(data: &[u8]) -> Result<String, Box<dyn std::error::Error>> {
    if !is_uf2(data) {
        return Err(CommandError::NotUf2.into());
    }
    let image = Uf2Image::new(data);
    let first = image.blocks().next().ok_or(CommandError::NotUf2)??;

    let mut out = String::new();
    out.push_str(&format!("Device: {}\n", first.device_description().unwrap_or_default()));
    out.push_str(&format!("Version: {}\n", first.version_description().unwrap_or_default()));
    out.push_str("Parts:\n");
    for range in image.ranges() {
        let range = range?;
        out.push_str(&format!(
            "  - 0x{:08x}: {:7} bytes",
            range.start_address,
            range.len()
        ));
        if let Some(addr) = range.reboot_address {
            out.push_str(&format!(" (reboot @ 0x{:08x})", addr));
        }
        out.push('\n');
    }
    Ok(out)
}

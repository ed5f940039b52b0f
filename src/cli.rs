//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a USB ID, always hexadecimal ("0483" or "0x0483")
pub fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(hex, 16).map_err(|e| format!("Invalid USB ID: {}", e))
}

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

const SIZE_SUFFIXES: [(&str, u32); 6] = [
    ("KIB", 1 << 10),
    ("KB", 1 << 10),
    ("K", 1 << 10),
    ("MIB", 1 << 20),
    ("MB", 1 << 20),
    ("M", 1 << 20),
];

/// Parse a size such as "64K", "2M", "0x1000" or "4096"
///
/// Suffixes are binary: K = 1024, M = 1024 * 1024.
pub fn parse_size(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let (digits, multiplier) = SIZE_SUFFIXES
        .iter()
        .find_map(|&(suffix, mult)| upper.strip_suffix(suffix).map(|d| (d, mult)))
        .unwrap_or((upper.as_str(), 1));
    let digits = digits.trim_end();
    if digits.is_empty() {
        return Err(format!("Invalid size: {:?}", s));
    }
    let value = parse_hex_u32(digits).map_err(|e| format!("Invalid size {:?}: {}", s, e))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Size too large: {}", s))
}

#[derive(Parser)]
#[command(name = "rdfu")]
#[command(author, version, about = "USB DFU firmware flasher", long_about = None)]
pub struct Cli {
    /// Verbosity level (--verbose, --verbose --verbose)
    #[arg(long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Seconds to wait for a rebooted device to come back
    #[arg(long, value_name = "SECS", default_value_t = 30, global = true)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Device selection shared across commands
#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub struct DeviceArgs {
    /// Vendor ID (hex, e.g. "0483")
    #[arg(short, long, value_parser = parse_hex_u16)]
    pub vendor: Option<u16>,

    /// Product ID (hex, e.g. "df11")
    #[arg(short, long, value_parser = parse_hex_u16)]
    pub product: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List DFU devices with their memory layouts
    List {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Write a raw binary or UF2 file to the device
    Write {
        /// Input file (raw binary or UF2)
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        /// Start address for raw binaries (hex, e.g. 0x08000000)
        #[arg(short, long = "start-address", value_parser = parse_hex_u32)]
        start: Option<u32>,
    },

    /// Read device memory to a file
    Read {
        /// Output file
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        /// Start address (hex, e.g. 0x08000000)
        #[arg(short, long = "start-address", value_parser = parse_hex_u32)]
        start: Option<u32>,

        /// Length (e.g. 64K, 2M, 0x1000); defaults to the end of the memory
        #[arg(short, long, value_parser = parse_size)]
        length: Option<u32>,
    },

    /// Reboot the device and wait for it to come back
    Reboot {
        /// Where to write the reboot trigger (hex, e.g. 0x2001FFF0)
        #[arg(value_parser = parse_hex_u32)]
        address: u32,

        #[command(flatten)]
        device: DeviceArgs,

        /// Address to restart at
        #[arg(short, long = "start-address", value_parser = parse_hex_u32, default_value = "0x08000000")]
        start: u32,
    },

    /// Show the contents of a UF2 file
    Uf2 {
        /// UF2 file
        file: PathBuf,
    },
}

//! rdfu - USB DFU firmware flasher
//!
//! Flashes raw binaries and UF2 containers onto devices running a DFU
//! bootloader with the STM32 DfuSe extensions.
//!
//! # Architecture
//!
//! - `rdfu-core` turns an image into erase and download requests and drives
//!   reboots, independent of the transport
//! - `rdfu-usb` implements the device traits over USB with `nusb`
//! - this binary parses arguments, loads files and shows progress

mod cli;
mod commands;
mod progress;

use clap::Parser;
use cli::{Cli, Commands, DeviceArgs};
use progress::IndicatifProgress;
use rdfu_core::flash::FlashOptions;
use rdfu_core::reboot::{RediscoveryConfig, SystemClock};
use rdfu_core::DeviceFilter;
use std::fs;
use std::process::ExitCode;
use std::time::Duration;

/// Default log filter for a `--verbose` count; RUST_LOG still wins
fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(cli.verbose)))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn filter(args: DeviceArgs) -> DeviceFilter {
    DeviceFilter {
        vendor_id: args.vendor,
        product_id: args.product,
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let rediscovery = RediscoveryConfig {
        timeout: Duration::from_secs(cli.timeout),
        ..RediscoveryConfig::default()
    };

    let command = cli.command.unwrap_or(Commands::List {
        device: DeviceArgs::default(),
    });

    match command {
        Commands::List { device } => commands::list::run(&filter(device)),
        Commands::Write {
            file,
            device,
            start,
        } => {
            let image = commands::read_file(&file)?;
            let device = commands::open_device(&filter(device))?;
            let options = FlashOptions {
                start_address: start,
                rediscovery,
            };
            let mut progress = IndicatifProgress::new();
            commands::write::run(device, &image, &options, &SystemClock, &mut progress)?;
            progress.finish();
            Ok(())
        }
        Commands::Read {
            file,
            device,
            start,
            length,
        } => {
            let mut device = commands::open_device(&filter(device))?;
            let mut progress = IndicatifProgress::new();
            let data = commands::read::run(&mut device, start, length, &mut progress)?;
            progress.finish();
            fs::write(&file, &data)?;
            println!("Wrote {} bytes to {:?}", data.len(), file);
            Ok(())
        }
        Commands::Reboot {
            address,
            device,
            start,
        } => {
            let device = commands::open_device(&filter(device))?;
            let mut progress = IndicatifProgress::new();
            commands::reboot::run(device, address, start, rediscovery, &SystemClock, &mut progress)?;
            Ok(())
        }
        Commands::Uf2 { file } => {
            let data = fs::read(&file)?;
            print!("{}", commands::uf2::describe(&data)?);
            Ok(())
        }
    }
}

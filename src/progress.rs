//! Progress reporting with indicatif

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rdfu_core::progress::FlashProgress;
use std::time::Duration;

/// Create a progress bar with a phase label
fn create_progress_bar_with_phase(
    total: u64,
    phase: &str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Create a byte-counting progress bar with a phase label
fn create_bytes_bar_with_phase(
    total: u64,
    phase: &str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn create_spinner_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

/// Progress reporter using indicatif progress bars
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn set_bar(&mut self, pb: ProgressBar) {
        self.finish();
        self.current_bar = Some(self.multi.add(pb));
    }

    fn create_spinner(&mut self, message: String) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(create_spinner_style().unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.set_bar(pb);
    }

    fn position(&self, pos: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(pos as u64);
        }
    }

    /// Finish the current bar, leaving it on screen
    pub fn finish(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish();
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IndicatifProgress {
    fn drop(&mut self) {
        // An error can leave a bar running
        if let Some(pb) = self.current_bar.take() {
            pb.abandon();
        }
    }
}

impl FlashProgress for IndicatifProgress {
    fn erasing(&mut self, start: u32, pages: usize) {
        let phase = format!("Erasing pages at 0x{:08X}", start);
        let pb = create_progress_bar_with_phase(pages as u64, &phase)
            .unwrap_or_else(|_| ProgressBar::new(pages as u64));
        self.set_bar(pb);
    }

    fn erase_progress(&mut self, pages_done: usize, _pages_total: usize) {
        self.position(pages_done);
    }

    fn downloading(&mut self, start: u32, bytes: usize) {
        let phase = format!("Writing 0x{:08X}", start);
        let pb = create_bytes_bar_with_phase(bytes as u64, &phase)
            .unwrap_or_else(|_| ProgressBar::new(bytes as u64));
        self.set_bar(pb);
    }

    fn download_progress(&mut self, bytes_done: usize, _bytes_total: usize) {
        self.position(bytes_done);
    }

    fn rebooting(&mut self, reboot_address: u32) {
        self.create_spinner(format!(
            "Rebooting to 0x{:08X}, waiting for the device...",
            reboot_address
        ));
    }

    fn reconnected(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message("Device reconnected");
        }
    }

    fn reading(&mut self, start: u32, bytes: usize) {
        let phase = format!("Reading 0x{:08X}", start);
        let pb = create_bytes_bar_with_phase(bytes as u64, &phase)
            .unwrap_or_else(|_| ProgressBar::new(bytes as u64));
        self.set_bar(pb);
    }

    fn read_progress(&mut self, bytes_done: usize, _bytes_total: usize) {
        self.position(bytes_done);
    }
}

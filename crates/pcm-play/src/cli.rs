use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pcm-play", version)]
pub struct Args {
    /// WAVE files to play; each one plays on its own session, all at once
    #[arg(required_unless_present = "list_devices")]
    pub files: Vec<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Output device: `default`, `null`, or a substring of a device name
    #[arg(long, default_value = "default")]
    pub device: String,

    /// Open the device in non-blocking mode
    #[arg(long)]
    pub nonblock: bool,

    /// Upper bound for the device ring buffer in microseconds
    #[arg(long, default_value_t = 300_000)]
    pub buffer_micros: u32,

    /// Reader chunk size in device periods (higher => fewer wake-ups, more memory)
    #[arg(long, default_value_t = 3)]
    pub chunk_periods: usize,
}

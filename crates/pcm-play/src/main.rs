//! pcm-play: stream one or more WAVE files to an output device.
//!
//! Each file gets its own session (a reader thread and a player thread); all of them play
//! at once until `q` is typed or Ctrl-C is pressed.

mod cli;
mod config;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,pcm_stream=info,pcm_play=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }
    runtime::run_play(config::PlayConfig::from(&args))
}

use std::path::PathBuf;

pub use pcm_stream::config::StreamConfig;

use crate::cli::Args;

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub files: Vec<PathBuf>,
    pub device: String,
    pub stream: StreamConfig,
}

impl From<&Args> for PlayConfig {
    fn from(args: &Args) -> Self {
        Self {
            files: args.files.clone(),
            device: args.device.clone(),
            stream: StreamConfig {
                chunk_periods: args.chunk_periods.max(1),
                max_ring_buffer_micros: args.buffer_micros,
                nonblocking: args.nonblock,
                ..StreamConfig::default()
            },
        }
    }
}

//! Error types for the streaming engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::PcmState;

/// Errors raised while opening a WAVE container.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The file does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// The header is not `RIFF`/`RIFX` + `WAVE`.
    #[error("not a WAVE file (bad magic)")]
    BadMagic,

    /// Encoding other than integer PCM or IEEE float, or an unplayable sample layout.
    #[error("unsupported WAVE encoding: format tag 0x{tag:04x}, {bits} bits")]
    UnsupportedEncoding { tag: u16, bits: u16 },

    /// Zero channels declared in the fmt chunk.
    #[error("can't play WAVE files with {0} channels")]
    InvalidChannels(u16),

    /// A chunk is truncated, too small or missing.
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Low-level outcome of a backend call, mirroring the conditions a PCM driver reports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PcmError {
    /// Not ready; try again after waiting.
    #[error("device not ready")]
    WouldBlock,

    /// The hardware ring ran dry.
    #[error("buffer underrun")]
    Underrun,

    /// The device was suspended.
    #[error("device suspended")]
    Suspended,

    #[error("{0}")]
    Fatal(String),
}

/// Errors raised by [`crate::device::PlaybackDevice`].
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio open error: {0}")]
    Open(String),

    #[error("no output device matched: {0}")]
    NotFound(String),

    #[error("sample format {0} not available")]
    FormatUnavailable(String),

    #[error("channel count {0} not available")]
    ChannelsUnavailable(u16),

    #[error("unable to install hw params: {0}")]
    HwParams(String),

    #[error("can't use period equal to buffer size ({period} == {buffer})")]
    DegenerateGeometry { period: usize, buffer: usize },

    #[error("device is not configured")]
    NotConfigured,

    #[error("device is closed")]
    Closed,

    #[error("write error: {0}")]
    Write(String),

    #[error("read/write error, state = {0}")]
    UnexpectedState(PcmState),

    #[error("{stage}: prepare error: {reason}")]
    Prepare { stage: &'static str, reason: String },

    #[error("status error: {0}")]
    Status(String),

    #[error("drain error: {0}")]
    Drain(String),

    /// The caller's cancel predicate fired while waiting for the device.
    #[error("write interrupted")]
    Interrupted,
}

/// Errors returned by [`crate::session::Session::play`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported container: {0}")]
    UnsupportedContainer(PathBuf),

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: OpenError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to spawn {task} task: {source}")]
    Spawn {
        task: &'static str,
        #[source]
        source: io::Error,
    },
}

//! Playback device: parameter negotiation and the recovering write path.
//!
//! [`PlaybackDevice`] owns one [`PcmBackend`] (the sink) and exposes message-style
//! operations only: `configure`, `write`, `drain`, `close`. Transient conditions reported by
//! the backend (not ready, underrun, suspend) are handled here by an explicit write state
//! machine so the player never sees them:
//!
//! ```text
//! Normal --Underrun--> Recovering(Underrun) --prepare ok--> Normal
//! Normal --Suspended-> Recovering(Suspended) --resume/prepare ok--> Normal
//! Recovering(_) --second-order failure--> Failed
//! ```

pub mod host;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::error::{DeviceError, PcmError};
use crate::format::SampleFormat;

pub use memory::{CaptureHandle, Fault, MemoryBackend};

/// Device identifier that selects the in-memory sink instead of host audio.
pub const NULL_DEVICE: &str = "null";

/// Driver-level stream state, as reported by [`PcmBackend::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmState {
    Open,
    Setup,
    Prepared,
    Running,
    Xrun,
    Draining,
    Suspended,
    Disconnected,
}

impl fmt::Display for PcmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PcmState::Open => "OPEN",
            PcmState::Setup => "SETUP",
            PcmState::Prepared => "PREPARED",
            PcmState::Running => "RUNNING",
            PcmState::Xrun => "XRUN",
            PcmState::Draining => "DRAINING",
            PcmState::Suspended => "SUSPENDED",
            PcmState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Period and ring sizes chosen by the backend, in frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwGeometry {
    pub period_frames: usize,
    pub buffer_frames: usize,
}

/// Software thresholds, in frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwParams {
    /// Playback starts once this many frames are queued.
    pub start_threshold: usize,
    /// The stream stops with an underrun once this many frames are free.
    pub stop_threshold: usize,
    /// Writers are woken when at least this many frames are free.
    pub avail_min: usize,
}

/// Parameters fixed by [`PlaybackDevice::configure`] for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceParams {
    pub format: SampleFormat,
    pub channels: u16,
    /// Negotiated rate (may differ slightly from the source rate).
    pub rate: u32,
    pub bytes_per_frame: usize,
    pub bits_per_frame: usize,
    /// Hardware chunk (one period) in frames.
    pub chunk_frames: usize,
    /// Hardware chunk in bytes.
    pub chunk_bytes: usize,
    pub buffer_frames: usize,
}

/// Driver primitives a sink has to provide.
///
/// The shape follows a classic PCM driver API: hardware parameters are negotiated step by
/// step, writes are interleaved frames, and stalls are reported as [`PcmError`] values.
pub trait PcmBackend: Send {
    fn name(&self) -> &str;

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), PcmError>;

    /// Request interleaved access with the given sample format and channel count.
    fn set_hw_format(&mut self, format: SampleFormat, channels: u16) -> Result<(), DeviceError>;

    /// Request a rate near `rate`; returns the rate the device will actually run at.
    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError>;

    /// Largest ring buffer the device supports, in microseconds.
    fn buffer_time_max(&self) -> u32;

    fn install_hw_params(
        &mut self,
        buffer_time_us: u32,
        period_time_us: u32,
    ) -> Result<HwGeometry, DeviceError>;

    fn install_sw_params(&mut self, sw: SwParams) -> Result<(), DeviceError>;

    /// Write up to `frames` interleaved frames from `data`; returns frames accepted.
    fn write_frames(&mut self, data: &[u8], frames: usize) -> Result<usize, PcmError>;

    /// Wait until the device can accept at least `avail_min` frames. Returns `false` on timeout.
    fn wait(&mut self, timeout: Duration) -> bool;

    fn state(&mut self) -> Result<PcmState, PcmError>;

    fn prepare(&mut self) -> Result<(), PcmError>;

    /// Resume after a suspend. `Err(PcmError::WouldBlock)` means "not yet, try again".
    fn resume(&mut self) -> Result<(), PcmError>;

    /// Play out everything queued and stop.
    fn drain(&mut self) -> Result<(), PcmError>;
}

/// Turns a device identifier into a backend.
pub type BackendFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn PcmBackend>, DeviceError> + Send + Sync>;

/// Resolve `null` to a discarding memory sink and anything else to a host output device.
pub fn default_backend_factory() -> BackendFactory {
    Arc::new(|device_id: &str| -> Result<Box<dyn PcmBackend>, DeviceError> {
        if device_id.trim().eq_ignore_ascii_case(NULL_DEVICE) {
            return Ok(Box::new(MemoryBackend::discarding()));
        }
        Ok(Box::new(host::CpalBackend::open(device_id)?))
    })
}

/// Which transient condition the write path is recovering from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    Underrun,
    Suspended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    Normal,
    Recovering(Recovery),
    /// A recovery step itself failed; the device is unusable for this session.
    Failed,
}

/// Recovery counters kept by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub underruns: u64,
    pub suspends: u64,
}

pub struct PlaybackDevice {
    backend: Option<Box<dyn PcmBackend>>,
    name: String,
    nonblocking: bool,
    params: Option<DeviceParams>,
    state: WriteState,
    scratch: Vec<u8>,
    write_wait: Duration,
    suspend_backoff: Duration,
    rate_tolerance: f64,
    recoveries: RecoveryStats,
}

impl PlaybackDevice {
    /// Open a device by identifier using [`default_backend_factory`].
    pub fn open(device_id: &str, nonblocking: bool) -> Result<Self, DeviceError> {
        let backend = default_backend_factory()(device_id)?;
        Self::open_with(backend, nonblocking)
    }

    /// Take ownership of an already opened backend.
    pub fn open_with(mut backend: Box<dyn PcmBackend>, nonblocking: bool) -> Result<Self, DeviceError> {
        if nonblocking {
            backend
                .set_nonblocking(true)
                .map_err(|e| DeviceError::Open(format!("nonblock setting error: {e}")))?;
        }
        let defaults = StreamConfig::default();
        let name = backend.name().to_string();
        tracing::debug!(device = %name, nonblocking, "device opened");
        Ok(Self {
            backend: Some(backend),
            name,
            nonblocking,
            params: None,
            state: WriteState::Normal,
            scratch: Vec::new(),
            write_wait: defaults.write_wait,
            suspend_backoff: defaults.suspend_backoff,
            rate_tolerance: defaults.rate_tolerance,
            recoveries: RecoveryStats::default(),
        })
    }

    /// Apply timing knobs from `cfg`.
    pub fn with_config(mut self, cfg: &StreamConfig) -> Self {
        self.write_wait = cfg.write_wait;
        self.suspend_backoff = cfg.suspend_backoff;
        self.rate_tolerance = cfg.rate_tolerance;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> Option<DeviceParams> {
        self.params
    }

    pub fn write_state(&self) -> WriteState {
        self.state
    }

    pub fn recoveries(&self) -> RecoveryStats {
        self.recoveries
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Negotiate hardware and software parameters for a stream.
    ///
    /// The ring buffer is capped at `max_ring_buffer_micros` and split into four periods.
    /// Start and stop thresholds are both the full ring, so playback only begins once the
    /// ring is full.
    pub fn configure(
        &mut self,
        format: SampleFormat,
        channels: u16,
        rate: u32,
        max_ring_buffer_micros: u32,
    ) -> Result<DeviceParams, DeviceError> {
        let tolerance = self.rate_tolerance;
        let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;

        backend.set_hw_format(format, channels)?;

        let actual_rate = backend.set_rate_near(rate)?;
        if rate_out_of_tolerance(rate, actual_rate, tolerance) {
            tracing::warn!(
                device = %backend.name(),
                requested_hz = rate,
                got_hz = actual_rate,
                "rate is not accurate"
            );
        }

        let buffer_time = backend.buffer_time_max().min(max_ring_buffer_micros);
        let period_time = buffer_time / 4;
        if period_time == 0 {
            return Err(DeviceError::HwParams(format!(
                "buffer time too small ({buffer_time} us)"
            )));
        }

        let geometry = backend.install_hw_params(buffer_time, period_time)?;
        if geometry.period_frames == geometry.buffer_frames {
            return Err(DeviceError::DegenerateGeometry {
                period: geometry.period_frames,
                buffer: geometry.buffer_frames,
            });
        }

        backend.install_sw_params(SwParams {
            start_threshold: geometry.buffer_frames,
            stop_threshold: geometry.buffer_frames,
            avail_min: geometry.period_frames,
        })?;

        let bytes_per_frame = format.bytes_per_sample() * channels as usize;
        let params = DeviceParams {
            format,
            channels,
            rate: actual_rate,
            bytes_per_frame,
            bits_per_frame: bytes_per_frame * 8,
            chunk_frames: geometry.period_frames,
            chunk_bytes: geometry.period_frames * bytes_per_frame,
            buffer_frames: geometry.buffer_frames,
        };
        tracing::info!(
            device = %self.name,
            format = %format,
            channels,
            rate_hz = actual_rate,
            buffer_us = buffer_time,
            period_frames = params.chunk_frames,
            buffer_frames = params.buffer_frames,
            "device configured"
        );
        self.params = Some(params);
        self.state = WriteState::Normal;
        Ok(params)
    }

    /// Write `frames` frames from `data`, recovering from transient stalls.
    pub fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        self.write_cancellable(data, frames, &|| false)
    }

    /// Like [`write`](Self::write), but `cancelled` is polled whenever the device makes the
    /// caller wait (not-ready waits and suspend polls). Returns [`DeviceError::Interrupted`]
    /// once it reports `true`.
    ///
    /// A slice shorter than one period is padded with silence up to a full period. The
    /// returned count excludes the padding.
    pub fn write_cancellable(
        &mut self,
        data: &[u8],
        frames: usize,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<usize, DeviceError> {
        let params = self.params.ok_or(DeviceError::NotConfigured)?;
        if self.state == WriteState::Failed {
            return Err(DeviceError::Write("device failed earlier in this session".to_string()));
        }
        let bpf = params.bytes_per_frame;
        debug_assert!(
            data.len() >= frames * bpf,
            "write of {frames} frames with only {} bytes",
            data.len()
        );
        if frames == 0 {
            return Ok(0);
        }

        let mut padded = std::mem::take(&mut self.scratch);
        let (buf, mut count): (&[u8], usize) = if frames < params.chunk_frames {
            padded.clear();
            padded.extend_from_slice(&data[..frames * bpf]);
            padded.resize(params.chunk_bytes, 0);
            params.format.fill_silence(&mut padded[frames * bpf..]);
            (&padded, params.chunk_frames)
        } else {
            (&data[..frames * bpf], frames)
        };

        let result = self.write_all(buf, &mut count, bpf, cancelled);
        self.scratch = padded;
        result.map(|written| written.min(frames))
    }

    fn write_all(
        &mut self,
        buf: &[u8],
        count: &mut usize,
        bpf: usize,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<usize, DeviceError> {
        let mut offset = 0;
        let mut written = 0;
        while *count > 0 {
            let write_wait = self.write_wait;
            let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;
            match backend.write_frames(&buf[offset..], *count) {
                Ok(n) => {
                    if n < *count {
                        backend.wait(write_wait);
                        if n == 0 && cancelled() {
                            return Err(DeviceError::Interrupted);
                        }
                    }
                    written += n;
                    *count -= n;
                    offset += n * bpf;
                }
                Err(PcmError::WouldBlock) => {
                    backend.wait(write_wait);
                    if cancelled() {
                        return Err(DeviceError::Interrupted);
                    }
                }
                Err(PcmError::Underrun) => self.recover(Recovery::Underrun, cancelled)?,
                Err(PcmError::Suspended) => self.recover(Recovery::Suspended, cancelled)?,
                Err(PcmError::Fatal(reason)) => {
                    tracing::error!(device = %self.name, "write error: {reason}");
                    return Err(DeviceError::Write(reason));
                }
            }
        }
        Ok(written)
    }

    fn recover(&mut self, kind: Recovery, cancelled: &dyn Fn() -> bool) -> Result<(), DeviceError> {
        self.state = WriteState::Recovering(kind);
        let result = match kind {
            Recovery::Underrun => self.recover_underrun(),
            Recovery::Suspended => self.recover_suspend(cancelled),
        };
        self.state = match &result {
            Ok(()) => WriteState::Normal,
            Err(DeviceError::Interrupted) => WriteState::Recovering(kind),
            Err(_) => WriteState::Failed,
        };
        result
    }

    fn recover_underrun(&mut self) -> Result<(), DeviceError> {
        let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;
        let state = backend
            .state()
            .map_err(|e| DeviceError::Status(e.to_string()))?;
        if state != PcmState::Xrun {
            tracing::error!(device = %self.name, state = %state, "read/write error");
            return Err(DeviceError::UnexpectedState(state));
        }
        backend.prepare().map_err(|e| DeviceError::Prepare {
            stage: "xrun",
            reason: e.to_string(),
        })?;
        self.recoveries.underruns += 1;
        tracing::warn!(
            device = %self.name,
            underruns = self.recoveries.underruns,
            "underrun; device re-prepared"
        );
        Ok(())
    }

    fn recover_suspend(&mut self, cancelled: &dyn Fn() -> bool) -> Result<(), DeviceError> {
        let backoff = self.suspend_backoff;
        let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;
        tracing::info!(device = %self.name, "device suspended; waiting for resume");
        loop {
            match backend.resume() {
                Ok(()) => break,
                Err(PcmError::WouldBlock) => {
                    if cancelled() {
                        return Err(DeviceError::Interrupted);
                    }
                    thread::sleep(backoff);
                }
                Err(e) => {
                    tracing::debug!(device = %self.name, "resume failed ({e}); preparing");
                    backend.prepare().map_err(|e| DeviceError::Prepare {
                        stage: "suspend",
                        reason: e.to_string(),
                    })?;
                    break;
                }
            }
        }
        self.recoveries.suspends += 1;
        tracing::info!(device = %self.name, "device resumed");
        Ok(())
    }

    /// Play out everything queued. Non-blocking mode is lifted for the duration so the drain
    /// actually waits, then restored.
    pub fn drain(&mut self) -> Result<(), DeviceError> {
        let nonblocking = self.nonblocking;
        let backend = self.backend.as_mut().ok_or(DeviceError::Closed)?;
        if nonblocking {
            backend
                .set_nonblocking(false)
                .map_err(|e| DeviceError::Drain(e.to_string()))?;
        }
        let result = backend.drain().map_err(|e| DeviceError::Drain(e.to_string()));
        if nonblocking {
            if let Err(e) = backend.set_nonblocking(true) {
                tracing::warn!(device = %self.name, "nonblock restore error: {e}");
            }
        }
        result
    }

    /// Release the backend. Safe to call more than once.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            tracing::debug!(device = %self.name, "device closed");
        }
    }
}

impl Drop for PlaybackDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn rate_out_of_tolerance(requested: u32, got: u32, tolerance: f64) -> bool {
    let requested = requested as f64;
    let got = got as f64;
    got > requested * (1.0 + tolerance) || got < requested * (1.0 - tolerance)
}

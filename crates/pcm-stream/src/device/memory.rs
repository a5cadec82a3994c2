//! In-memory sink.
//!
//! Records every frame written (unless created with [`MemoryBackend::discarding`]), can
//! pace writes against a wall clock, and replays scripted [`Fault`]s so the recovery paths
//! of [`super::PlaybackDevice`] can be driven deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::{HwGeometry, PcmBackend, PcmState, SwParams};
use crate::error::{DeviceError, PcmError};
use crate::format::SampleFormat;

/// A scripted event, consumed by the next `write_frames` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Report "not ready" once.
    WouldBlock,
    /// Accept at most this many frames.
    Partial(usize),
    /// Report an underrun; status then says `Xrun`.
    Underrun,
    /// Report an underrun while status reports the given state.
    UnderrunInState(PcmState),
    /// Report a suspend; `resume` answers "again" this many times first.
    Suspend { again: u32 },
    /// Report a suspend whose resume fails outright.
    SuspendUnresumable,
    /// The next `prepare` fails. Does not consume a write.
    PrepareFails,
    Fatal(String),
}

/// Everything a [`MemoryBackend`] observed.
#[derive(Debug, Default)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub frames: u64,
    pub writes: usize,
    pub waits: usize,
    pub prepares: usize,
    pub resumes: usize,
    pub drains: usize,
    pub nonblock_history: Vec<bool>,
    pub sw: Option<SwParams>,
    pub closed: bool,
}

/// Shared view of a [`MemoryBackend`]'s capture, usable after the backend moved threads.
#[derive(Clone, Debug, Default)]
pub struct CaptureHandle(Arc<Mutex<Capture>>);

impl CaptureHandle {
    fn lock(&self) -> MutexGuard<'_, Capture> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    pub fn frames(&self) -> u64 {
        self.lock().frames
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn waits(&self) -> usize {
        self.lock().waits
    }

    pub fn prepares(&self) -> usize {
        self.lock().prepares
    }

    pub fn resumes(&self) -> usize {
        self.lock().resumes
    }

    pub fn drains(&self) -> usize {
        self.lock().drains
    }

    pub fn nonblock_history(&self) -> Vec<bool> {
        self.lock().nonblock_history.clone()
    }

    pub fn sw_params(&self) -> Option<SwParams> {
        self.lock().sw
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

pub struct MemoryBackend {
    name: String,
    capture: CaptureHandle,
    keep_bytes: bool,
    faults: VecDeque<Fault>,
    max_buffer_time_us: u32,
    rate_step: Option<u32>,
    degenerate_period: bool,
    refused_formats: Vec<SampleFormat>,
    max_channels: u16,
    pacing: Option<f64>,

    format: Option<SampleFormat>,
    channels: u16,
    rate: u32,
    sw: Option<SwParams>,
    state: PcmState,
    status_override: Option<PcmState>,
    nonblocking: bool,
    resume_again: u32,
    resume_fails: bool,
    prepare_fails: bool,
    queued_frames: u64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            capture: CaptureHandle::default(),
            keep_bytes: true,
            faults: VecDeque::new(),
            max_buffer_time_us: 500_000,
            rate_step: None,
            degenerate_period: false,
            refused_formats: Vec::new(),
            max_channels: u16::MAX,
            pacing: None,
            format: None,
            channels: 0,
            rate: 0,
            sw: None,
            state: PcmState::Open,
            status_override: None,
            nonblocking: false,
            resume_again: 0,
            resume_fails: false,
            prepare_fails: false,
            queued_frames: 0,
        }
    }

    /// A sink that counts frames but keeps no bytes, paced at real time.
    pub fn discarding() -> Self {
        let mut backend = Self::new().with_pacing(1.0);
        backend.name = super::NULL_DEVICE.to_string();
        backend.keep_bytes = false;
        backend
    }

    pub fn capture(&self) -> CaptureHandle {
        self.capture.clone()
    }

    pub fn with_faults(mut self, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.faults.extend(faults);
        self
    }

    pub fn with_max_buffer_time(mut self, micros: u32) -> Self {
        self.max_buffer_time_us = micros;
        self
    }

    /// Round negotiated rates to a multiple of `step` Hz.
    pub fn with_rate_step(mut self, step: u32) -> Self {
        self.rate_step = Some(step.max(1));
        self
    }

    pub fn with_degenerate_period(mut self) -> Self {
        self.degenerate_period = true;
        self
    }

    pub fn refusing_format(mut self, format: SampleFormat) -> Self {
        self.refused_formats.push(format);
        self
    }

    pub fn with_max_channels(mut self, channels: u16) -> Self {
        self.max_channels = channels;
        self
    }

    /// Sleep after each write for the written duration divided by `speed`.
    pub fn with_pacing(mut self, speed: f64) -> Self {
        self.pacing = (speed > 0.0).then_some(speed);
        self
    }

    fn bytes_per_frame(&self) -> usize {
        self.format.map(|f| f.bytes_per_sample()).unwrap_or(1) * self.channels.max(1) as usize
    }

    fn take_prepare_fault(&mut self) {
        if self.faults.front() == Some(&Fault::PrepareFails) {
            self.faults.pop_front();
            self.prepare_fails = true;
        }
    }

    fn accept(&mut self, data: &[u8], frames: usize) -> usize {
        let bytes = frames * self.bytes_per_frame();
        {
            let mut cap = self.capture.lock();
            if self.keep_bytes {
                cap.bytes.extend_from_slice(&data[..bytes]);
            }
            cap.frames += frames as u64;
            cap.writes += 1;
        }
        self.queued_frames += frames as u64;
        if self.state == PcmState::Prepared {
            let start = self.sw.map(|s| s.start_threshold as u64).unwrap_or(0);
            if self.queued_frames >= start {
                self.state = PcmState::Running;
            }
        }
        if let Some(speed) = self.pacing {
            if self.rate > 0 {
                let secs = frames as f64 / self.rate as f64 / speed;
                thread::sleep(Duration::from_secs_f64(secs));
            }
        }
        frames
    }
}

impl PcmBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), PcmError> {
        self.nonblocking = nonblocking;
        self.capture.lock().nonblock_history.push(nonblocking);
        Ok(())
    }

    fn set_hw_format(&mut self, format: SampleFormat, channels: u16) -> Result<(), DeviceError> {
        if self.refused_formats.contains(&format) {
            return Err(DeviceError::FormatUnavailable(format.to_string()));
        }
        if channels == 0 || channels > self.max_channels {
            return Err(DeviceError::ChannelsUnavailable(channels));
        }
        self.format = Some(format);
        self.channels = channels;
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError> {
        let rate = match self.rate_step {
            Some(step) => (((rate + step / 2) / step) * step).max(step),
            None => rate,
        };
        self.rate = rate;
        Ok(rate)
    }

    fn buffer_time_max(&self) -> u32 {
        self.max_buffer_time_us
    }

    fn install_hw_params(
        &mut self,
        buffer_time_us: u32,
        period_time_us: u32,
    ) -> Result<HwGeometry, DeviceError> {
        let frames_for = |us: u32| (self.rate as u64 * us as u64 / 1_000_000) as usize;
        let buffer_frames = frames_for(buffer_time_us);
        let period_frames = if self.degenerate_period {
            buffer_frames
        } else {
            frames_for(period_time_us)
        };
        if buffer_frames == 0 || period_frames == 0 {
            return Err(DeviceError::HwParams(format!(
                "no configuration for {buffer_time_us} us at {} Hz",
                self.rate
            )));
        }
        let geometry = HwGeometry {
            period_frames,
            buffer_frames,
        };
        self.state = PcmState::Prepared;
        Ok(geometry)
    }

    fn install_sw_params(&mut self, sw: SwParams) -> Result<(), DeviceError> {
        self.sw = Some(sw);
        self.capture.lock().sw = Some(sw);
        Ok(())
    }

    fn write_frames(&mut self, data: &[u8], frames: usize) -> Result<usize, PcmError> {
        match self.state {
            PcmState::Xrun => return Err(PcmError::Underrun),
            PcmState::Suspended => return Err(PcmError::Suspended),
            _ => {}
        }
        self.take_prepare_fault();
        match self.faults.pop_front() {
            None => Ok(self.accept(data, frames)),
            Some(Fault::WouldBlock) => Err(PcmError::WouldBlock),
            Some(Fault::Partial(n)) => Ok(self.accept(data, n.min(frames))),
            Some(Fault::Underrun) => {
                self.state = PcmState::Xrun;
                self.take_prepare_fault();
                Err(PcmError::Underrun)
            }
            Some(Fault::UnderrunInState(state)) => {
                self.status_override = Some(state);
                Err(PcmError::Underrun)
            }
            Some(Fault::Suspend { again }) => {
                self.state = PcmState::Suspended;
                self.resume_again = again;
                self.take_prepare_fault();
                Err(PcmError::Suspended)
            }
            Some(Fault::SuspendUnresumable) => {
                self.state = PcmState::Suspended;
                self.resume_fails = true;
                self.take_prepare_fault();
                Err(PcmError::Suspended)
            }
            Some(Fault::PrepareFails) => {
                self.prepare_fails = true;
                Ok(self.accept(data, frames))
            }
            Some(Fault::Fatal(reason)) => Err(PcmError::Fatal(reason)),
        }
    }

    fn wait(&mut self, _timeout: Duration) -> bool {
        self.capture.lock().waits += 1;
        true
    }

    fn state(&mut self) -> Result<PcmState, PcmError> {
        Ok(self.status_override.take().unwrap_or(self.state))
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        self.capture.lock().prepares += 1;
        if std::mem::take(&mut self.prepare_fails) {
            return Err(PcmError::Fatal("prepare failed".to_string()));
        }
        self.state = PcmState::Prepared;
        self.queued_frames = 0;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PcmError> {
        self.capture.lock().resumes += 1;
        if self.state != PcmState::Suspended {
            return Ok(());
        }
        if std::mem::take(&mut self.resume_fails) {
            return Err(PcmError::Fatal("resume not supported".to_string()));
        }
        if self.resume_again > 0 {
            self.resume_again -= 1;
            return Err(PcmError::WouldBlock);
        }
        self.state = PcmState::Running;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), PcmError> {
        if self.nonblocking {
            return Err(PcmError::WouldBlock);
        }
        self.capture.lock().drains += 1;
        self.state = PcmState::Setup;
        self.queued_frames = 0;
        Ok(())
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.capture.lock().closed = true;
    }
}

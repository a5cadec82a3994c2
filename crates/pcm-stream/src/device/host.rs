//! Host audio output through CPAL.
//!
//! CPAL is callback driven while [`PcmBackend`] is a push API, so this backend keeps a ring of
//! `f32` samples ([`PcmRing`]) between the two:
//! - `write_frames` converts interleaved source bytes and pushes them into the ring
//! - the output callback pops from the ring once the start threshold was reached
//! - running dry while playing is reported back to the writer as an underrun
//!
//! `cpal::Stream` is not `Send` on every host, so the device and its stream live on a
//! dedicated owner thread that takes commands over a channel.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use super::{HwGeometry, PcmBackend, PcmState, SwParams};
use crate::error::{DeviceError, PcmError};
use crate::format::SampleFormat;

/// Largest ring the backend will allocate, in microseconds.
const BUFFER_TIME_MAX_US: u32 = 2_000_000;
/// Longest a blocking write sleeps before handing control back to the caller.
const BLOCKING_WRITE_SLICE: Duration = Duration::from_millis(100);
/// Extra time allowed for a drain on top of the queued audio.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// One output configuration range advertised by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OutputRange {
    channels: u16,
    min_rate: u32,
    max_rate: u32,
    sample_format: cpal::SampleFormat,
}

struct Opened {
    name: String,
    ranges: Vec<OutputRange>,
}

enum WorkerCommand {
    Build {
        config: cpal::StreamConfig,
        sample_format: cpal::SampleFormat,
        reply: Sender<Result<(), String>>,
    },
    Restart {
        reply: Sender<Result<(), String>>,
    },
    Shutdown,
}

pub struct CpalBackend {
    name: String,
    ranges: Vec<OutputRange>,
    ring: Arc<PcmRing>,
    cmd_tx: Sender<WorkerCommand>,
    worker: Option<JoinHandle<()>>,
    nonblocking: bool,

    format: Option<SampleFormat>,
    src_channels: u16,
    dev_channels: u16,
    rate: u32,
    sample_format: Option<cpal::SampleFormat>,
    scratch: Vec<f32>,
}

impl CpalBackend {
    /// Open an output device. `default` (or an empty id) selects the host default device,
    /// anything else is matched case-insensitively against device names.
    pub fn open(device_id: &str) -> Result<Self, DeviceError> {
        let needle = match device_id.trim() {
            "" => None,
            id if id.eq_ignore_ascii_case("default") => None,
            id => Some(id.to_string()),
        };
        let ring = Arc::new(PcmRing::new());
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (open_tx, open_rx) = crossbeam_channel::bounded(1);

        let worker_ring = ring.clone();
        let worker = thread::Builder::new()
            .name("pcm-cpal".to_string())
            .spawn(move || stream_owner_main(needle, worker_ring, open_tx, cmd_rx))
            .map_err(|e| DeviceError::Open(format!("spawn output thread: {e}")))?;

        let opened = match open_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(reason)) => {
                let _ = worker.join();
                return Err(if reason.starts_with("No output device matched") {
                    DeviceError::NotFound(device_id.to_string())
                } else {
                    DeviceError::Open(reason)
                });
            }
            Err(_) => {
                let _ = worker.join();
                return Err(DeviceError::Open("output thread exited".to_string()));
            }
        };
        tracing::debug!(device = %opened.name, ranges = opened.ranges.len(), "output device opened");

        Ok(Self {
            name: opened.name,
            ranges: opened.ranges,
            ring,
            cmd_tx,
            worker: Some(worker),
            nonblocking: false,
            format: None,
            src_channels: 0,
            dev_channels: 0,
            rate: 0,
            sample_format: None,
            scratch: Vec::new(),
        })
    }

    fn request(&self, make: impl FnOnce(Sender<Result<(), String>>) -> WorkerCommand) -> Result<(), String> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(make(reply))
            .map_err(|_| "output thread is gone".to_string())?;
        rx.recv().map_err(|_| "output thread is gone".to_string())?
    }

    /// Decode `frames` source frames into device-layout samples in `self.scratch`.
    fn convert(&mut self, data: &[u8], frames: usize) {
        let Some(format) = self.format else {
            return;
        };
        let bps = format.bytes_per_sample();
        let src_ch = self.src_channels as usize;
        let dev_ch = self.dev_channels as usize;
        let mut src = vec![0.0f32; src_ch];
        let mut dst = vec![0.0f32; dev_ch];
        self.scratch.clear();
        self.scratch.reserve(frames * dev_ch);
        for frame in data.chunks_exact(bps * src_ch).take(frames) {
            for (slot, sample) in src.iter_mut().zip(frame.chunks_exact(bps)) {
                *slot = format.sample_to_f32(sample);
            }
            map_frame(&src, &mut dst);
            self.scratch.extend_from_slice(&dst);
        }
    }
}

impl PcmBackend for CpalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), PcmError> {
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn set_hw_format(&mut self, format: SampleFormat, channels: u16) -> Result<(), DeviceError> {
        let Some(dev_channels) = pick_channels(&self.ranges, channels) else {
            tracing::warn!(
                device = %self.name,
                requested = channels,
                available = %describe_ranges(&self.ranges),
                "no usable channel layout"
            );
            return Err(DeviceError::ChannelsUnavailable(channels));
        };
        if dev_channels != channels {
            tracing::info!(
                device = %self.name,
                source = channels,
                output = dev_channels,
                "mapping channels"
            );
        }
        self.format = Some(format);
        self.src_channels = channels;
        self.dev_channels = dev_channels;
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError> {
        let (rate, sample_format) = pick_output_range(&self.ranges, self.dev_channels, rate)
            .ok_or_else(|| DeviceError::HwParams("no supported output configs".to_string()))?;
        self.rate = rate;
        self.sample_format = Some(sample_format);
        Ok(rate)
    }

    fn buffer_time_max(&self) -> u32 {
        BUFFER_TIME_MAX_US
    }

    fn install_hw_params(
        &mut self,
        buffer_time_us: u32,
        period_time_us: u32,
    ) -> Result<HwGeometry, DeviceError> {
        let sample_format = self.sample_format.ok_or(DeviceError::NotConfigured)?;
        let frames_for = |us: u32| (self.rate as u64 * us as u64 / 1_000_000) as usize;
        let geometry = HwGeometry {
            buffer_frames: frames_for(buffer_time_us),
            period_frames: frames_for(period_time_us),
        };
        if geometry.period_frames == 0 {
            return Err(DeviceError::HwParams(format!(
                "period of {period_time_us} us is empty at {} Hz",
                self.rate
            )));
        }
        self.ring.reset(self.dev_channels as usize, geometry.buffer_frames);
        let config = cpal::StreamConfig {
            channels: self.dev_channels,
            sample_rate: self.rate,
            buffer_size: cpal::BufferSize::Default,
        };
        self.request(|reply| WorkerCommand::Build {
            config,
            sample_format,
            reply,
        })
        .map_err(DeviceError::HwParams)?;
        Ok(geometry)
    }

    fn install_sw_params(&mut self, sw: SwParams) -> Result<(), DeviceError> {
        let mut inner = self.ring.lock();
        inner.start_threshold = sw.start_threshold;
        inner.stop_threshold = sw.stop_threshold;
        inner.avail_min = sw.avail_min.max(1);
        Ok(())
    }

    fn write_frames(&mut self, data: &[u8], frames: usize) -> Result<usize, PcmError> {
        self.convert(data, frames);
        let dev_ch = self.dev_channels as usize;
        let mut inner = self.ring.lock();
        if !self.nonblocking {
            let (guard, _) = self
                .ring
                .cond
                .wait_timeout_while(inner, BLOCKING_WRITE_SLICE, |r| {
                    r.state.is_writable() && r.free_frames() == 0
                })
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
        inner.check_writable()?;
        let free = inner.free_frames();
        if free == 0 {
            return if self.nonblocking {
                Err(PcmError::WouldBlock)
            } else {
                Ok(0)
            };
        }
        let n = frames.min(free).min(self.scratch.len() / dev_ch.max(1));
        inner.samples.extend(&self.scratch[..n * dev_ch]);
        if inner.state == PcmState::Prepared && inner.queued_frames() >= inner.start_threshold {
            inner.state = PcmState::Running;
        }
        Ok(n)
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let inner = self.ring.lock();
        let (inner, _) = self
            .ring
            .cond
            .wait_timeout_while(inner, timeout, |r| {
                r.state == PcmState::Running && r.free_frames() < r.avail_min
            })
            .unwrap_or_else(|e| e.into_inner());
        inner.state != PcmState::Running || inner.free_frames() >= inner.avail_min
    }

    fn state(&mut self) -> Result<PcmState, PcmError> {
        Ok(self.ring.lock().state)
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        let state = self.ring.lock().state;
        if matches!(state, PcmState::Suspended | PcmState::Disconnected) {
            self.request(|reply| WorkerCommand::Restart { reply })
                .map_err(PcmError::Fatal)?;
        }
        self.ring.restart();
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PcmError> {
        match self.request(|reply| WorkerCommand::Restart { reply }) {
            Ok(()) => {
                self.ring.restart();
                Ok(())
            }
            Err(reason) => {
                tracing::debug!(device = %self.name, "restart not possible yet: {reason}");
                Err(PcmError::WouldBlock)
            }
        }
    }

    fn drain(&mut self) -> Result<(), PcmError> {
        if self.nonblocking {
            return Err(PcmError::WouldBlock);
        }
        let mut inner = self.ring.lock();
        let queued = inner.queued_frames();
        if queued == 0 || !inner.state.is_writable() {
            inner.state = PcmState::Setup;
            return Ok(());
        }
        inner.state = PcmState::Draining;
        let rate = self.rate.max(1) as f64;
        let deadline = Duration::from_secs_f64(queued as f64 / rate) + DRAIN_GRACE;
        let started = Instant::now();
        let (mut inner, _) = self
            .ring
            .cond
            .wait_timeout_while(inner, deadline, |r| r.state == PcmState::Draining)
            .unwrap_or_else(|e| e.into_inner());
        if inner.state == PcmState::Draining {
            inner.state = PcmState::Setup;
            inner.samples.clear();
            return Err(PcmError::Fatal(format!(
                "drain did not finish within {:?}",
                started.elapsed()
            )));
        }
        Ok(())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Owns the CPAL device and stream for the lifetime of a [`CpalBackend`].
fn stream_owner_main(
    needle: Option<String>,
    ring: Arc<PcmRing>,
    open_tx: Sender<Result<Opened, String>>,
    cmd_rx: Receiver<WorkerCommand>,
) {
    let host = cpal::default_host();
    let device = match pick_device(&host, needle.as_deref()) {
        Ok(device) => device,
        Err(e) => {
            let _ = open_tx.send(Err(format!("{e:#}")));
            return;
        }
    };
    let opened = device_name(&device).and_then(|name| {
        let ranges = output_ranges(&device)?;
        Ok(Opened { name, ranges })
    });
    match opened {
        Ok(opened) => {
            if open_tx.send(Ok(opened)).is_err() {
                return;
            }
        }
        Err(e) => {
            let _ = open_tx.send(Err(format!("{e:#}")));
            return;
        }
    }

    let mut stream: Option<cpal::Stream> = None;
    let mut last: Option<(cpal::StreamConfig, cpal::SampleFormat)> = None;
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WorkerCommand::Build {
                config,
                sample_format,
                reply,
            } => {
                stream = None;
                let result = start_stream(&device, &config, sample_format, &ring);
                let result = result.map(|s| {
                    stream = Some(s);
                    last = Some((config, sample_format));
                });
                let _ = reply.send(result.map_err(|e| format!("{e:#}")));
            }
            WorkerCommand::Restart { reply } => {
                stream = None;
                let result = match &last {
                    Some((config, sample_format)) => {
                        start_stream(&device, config, *sample_format, &ring).map(|s| {
                            stream = Some(s);
                        })
                    }
                    None => Err(anyhow!("stream was never built")),
                };
                let _ = reply.send(result.map_err(|e| format!("{e:#}")));
            }
            WorkerCommand::Shutdown => break,
        }
    }
    drop(stream);
    tracing::debug!("output thread exiting");
}

fn start_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    ring: &Arc<PcmRing>,
) -> Result<cpal::Stream> {
    let stream = build_output_stream(device, config, sample_format, ring)?;
    stream.play().context("start output stream")?;
    Ok(stream)
}

/// Build a CPAL output stream fed from `ring`, converting to the device sample format.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    ring: &Arc<PcmRing>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, ring),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, ring),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, ring),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, ring),
        cpal::SampleFormat::U8 => build_stream::<u8>(device, config, ring),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: &Arc<PcmRing>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let ring_cb = ring.clone();
    let ring_err = ring.clone();
    let err_fn = move |err: cpal::StreamError| {
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            tracing::warn!("output device went away");
            ring_err.mark(PcmState::Suspended);
        } else {
            tracing::warn!("stream error: {err}");
        }
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            ring_cb.render(data, <T as cpal::Sample>::from_sample::<f32>);
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

struct RingInner {
    samples: VecDeque<f32>,
    channels: usize,
    capacity_frames: usize,
    start_threshold: usize,
    stop_threshold: usize,
    avail_min: usize,
    state: PcmState,
}

impl RingInner {
    fn queued_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    fn free_frames(&self) -> usize {
        self.capacity_frames.saturating_sub(self.queued_frames())
    }

    fn check_writable(&self) -> Result<(), PcmError> {
        match self.state {
            PcmState::Xrun => Err(PcmError::Underrun),
            PcmState::Suspended => Err(PcmError::Suspended),
            PcmState::Disconnected => Err(PcmError::Fatal("device disconnected".to_string())),
            PcmState::Open => Err(PcmError::Fatal("stream not configured".to_string())),
            _ => Ok(()),
        }
    }
}

impl PcmState {
    fn is_writable(self) -> bool {
        matches!(self, PcmState::Prepared | PcmState::Running)
    }
}

/// Sample ring shared by the writer and the output callback.
struct PcmRing {
    inner: Mutex<RingInner>,
    cond: Condvar,
}

impl PcmRing {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                samples: VecDeque::new(),
                channels: 1,
                capacity_frames: 0,
                start_threshold: 0,
                stop_threshold: 0,
                avail_min: 1,
                state: PcmState::Open,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset(&self, channels: usize, capacity_frames: usize) {
        let mut inner = self.lock();
        inner.samples = VecDeque::with_capacity(capacity_frames * channels);
        inner.channels = channels.max(1);
        inner.capacity_frames = capacity_frames;
        inner.start_threshold = capacity_frames;
        inner.stop_threshold = capacity_frames;
        inner.state = PcmState::Prepared;
        drop(inner);
        self.cond.notify_all();
    }

    /// Drop queued audio and go back to `Prepared`.
    fn restart(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.state = PcmState::Prepared;
        drop(inner);
        self.cond.notify_all();
    }

    fn mark(&self, state: PcmState) {
        self.lock().state = state;
        self.cond.notify_all();
    }

    /// Fill one callback buffer. Outputs silence unless playing; running dry while playing
    /// turns into `Xrun` (or completes a drain).
    fn render<T: Copy>(&self, out: &mut [T], convert: impl Fn(f32) -> T) {
        let silence = convert(0.0);
        let mut inner = self.lock();
        if !matches!(inner.state, PcmState::Running | PcmState::Draining) {
            out.fill(silence);
            return;
        }
        let mut filled = 0;
        for slot in out.iter_mut() {
            match inner.samples.pop_front() {
                Some(s) => {
                    *slot = convert(s);
                    filled += 1;
                }
                None => break,
            }
        }
        if filled < out.len() {
            out[filled..].fill(silence);
            if inner.samples.is_empty() {
                inner.state = match inner.state {
                    PcmState::Draining => PcmState::Setup,
                    _ if inner.free_frames() >= inner.stop_threshold => PcmState::Xrun,
                    other => other,
                };
            }
        }
        drop(inner);
        self.cond.notify_all();
    }
}

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

fn device_name(device: &cpal::Device) -> Result<String> {
    Ok(device.description().context("device description")?.name().to_string())
}

fn output_ranges(device: &cpal::Device) -> Result<Vec<OutputRange>> {
    let ranges: Vec<OutputRange> = device
        .supported_output_configs()
        .context("supported output configs")?
        .map(|r| OutputRange {
            channels: r.channels(),
            min_rate: r.min_sample_rate(),
            max_rate: r.max_sample_rate(),
            sample_format: r.sample_format(),
        })
        .filter(|r| sample_format_rank(r.sample_format) < UNSUPPORTED_RANK)
        .collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }
    Ok(ranges)
}

/// Names of the host's output devices, in enumeration order.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.to_string());
    }
    Ok(names)
}

/// One line per advertised range, e.g. `2ch 44100-48000 Hz F32`.
fn describe_ranges(ranges: &[OutputRange]) -> String {
    if ranges.is_empty() {
        return "none".to_string();
    }
    ranges
        .iter()
        .map(|r| format!("{}ch {}-{} Hz {:?}", r.channels, r.min_rate, r.max_rate, r.sample_format))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Output channel count for a source with `channels` channels: an exact match, or a
/// layout [`map_frame`] can convert to.
fn pick_channels(ranges: &[OutputRange], channels: u16) -> Option<u16> {
    let has = |c: u16| ranges.iter().any(|r| r.channels == c);
    if has(channels) {
        return Some(channels);
    }
    match channels {
        1 if has(2) => Some(2),
        2 if has(1) => Some(1),
        _ => None,
    }
}

/// Best `(rate, sample_format)` among ranges with `channels` channels.
///
/// Prefers the highest rate not above `target`, then the richer sample format.
fn pick_output_range(
    ranges: &[OutputRange],
    channels: u16,
    target: u32,
) -> Option<(u32, cpal::SampleFormat)> {
    let mut best: Option<(bool, u32, u8, cpal::SampleFormat)> = None;
    for range in ranges.iter().filter(|r| r.channels == channels) {
        let rate = pick_rate_for_range(range.min_rate, range.max_rate, Some(target));
        let below = rate <= target;
        let rank = sample_format_rank(range.sample_format);
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, rank, range.sample_format));
        }
    }
    best.map(|(_, rate, _, format)| (rate, format))
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

const UNSUPPORTED_RANK: u8 = 10;

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        cpal::SampleFormat::U8 => 4,
        _ => UNSUPPORTED_RANK,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Map one frame between channel layouts.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - anything else: clamp to the available source channels
fn map_frame(src: &[f32], dst: &mut [f32]) {
    let get = |ch: usize| src.get(ch).copied().unwrap_or(0.0);
    match (src.len(), dst.len()) {
        (2, 1) => dst[0] = 0.5 * (get(0) + get(1)),
        (n, _) => {
            for (ch, out) in dst.iter_mut().enumerate() {
                *out = get(ch.min(n.saturating_sub(1)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(channels: u16, min: u32, max: u32, fmt: cpal::SampleFormat) -> OutputRange {
        OutputRange {
            channels,
            min_rate: min,
            max_rate: max,
            sample_format: fmt,
        }
    }

    fn running_ring(frames: &[f32]) -> PcmRing {
        let ring = PcmRing::new();
        ring.reset(1, 4);
        {
            let mut inner = ring.lock();
            inner.samples.extend(frames);
            inner.state = PcmState::Running;
        }
        ring
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn pick_rate_for_range_clamps_to_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn is_better_candidate_orders_below_rate_then_format() {
        assert!(is_better_candidate(true, 48_000, 1, false, 48_000, 1));
        assert!(is_better_candidate(true, 96_000, 2, true, 48_000, 2));
        assert!(is_better_candidate(true, 48_000, 0, true, 48_000, 2));
    }

    #[test]
    fn pick_output_range_prefers_exact_rate_and_float() {
        let ranges = [
            range(2, 8_000, 48_000, cpal::SampleFormat::I16),
            range(2, 8_000, 48_000, cpal::SampleFormat::F32),
            range(1, 8_000, 8_000, cpal::SampleFormat::F32),
        ];
        assert_eq!(
            pick_output_range(&ranges, 2, 44_100),
            Some((44_100, cpal::SampleFormat::F32))
        );
        assert_eq!(
            pick_output_range(&ranges, 1, 44_100),
            Some((8_000, cpal::SampleFormat::F32))
        );
        assert_eq!(pick_output_range(&ranges, 6, 44_100), None);
    }

    #[test]
    fn pick_channels_maps_mono_and_stereo() {
        let stereo_only = [range(2, 44_100, 48_000, cpal::SampleFormat::F32)];
        assert_eq!(pick_channels(&stereo_only, 2), Some(2));
        assert_eq!(pick_channels(&stereo_only, 1), Some(2));
        assert_eq!(pick_channels(&stereo_only, 6), None);
        let mono_only = [range(1, 44_100, 48_000, cpal::SampleFormat::F32)];
        assert_eq!(pick_channels(&mono_only, 2), Some(1));
    }

    #[test]
    fn describe_ranges_lists_every_layout() {
        assert_eq!(describe_ranges(&[]), "none");
        let ranges = [
            range(2, 44_100, 48_000, cpal::SampleFormat::F32),
            range(6, 48_000, 48_000, cpal::SampleFormat::I16),
        ];
        assert_eq!(
            describe_ranges(&ranges),
            "2ch 44100-48000 Hz F32, 6ch 48000-48000 Hz I16"
        );
    }

    #[test]
    fn map_frame_duplicates_and_averages() {
        let mut stereo = [0.0; 2];
        map_frame(&[0.5], &mut stereo);
        assert_eq!(stereo, [0.5, 0.5]);
        let mut mono = [0.0; 1];
        map_frame(&[0.25, 0.75], &mut mono);
        assert_eq!(mono, [0.5]);
    }

    #[test]
    fn render_outputs_silence_until_running() {
        let ring = PcmRing::new();
        ring.reset(1, 4);
        ring.lock().samples.extend([0.5, 0.5]);
        let mut out = [1.0f32; 4];
        ring.render(&mut out, |s| s);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(ring.lock().queued_frames(), 2);
    }

    #[test]
    fn render_running_dry_is_an_underrun() {
        let ring = running_ring(&[0.1, 0.2]);
        let mut out = [1.0f32; 4];
        ring.render(&mut out, |s| s);
        assert_eq!(out, [0.1, 0.2, 0.0, 0.0]);
        let inner = ring.lock();
        assert_eq!(inner.state, PcmState::Xrun);
        assert_eq!(inner.check_writable(), Err(PcmError::Underrun));
    }

    #[test]
    fn render_finishes_a_drain_when_empty() {
        let ring = running_ring(&[0.1]);
        ring.lock().state = PcmState::Draining;
        let mut out = [0.0f32; 2];
        ring.render(&mut out, |s| s);
        assert_eq!(ring.lock().state, PcmState::Setup);
    }

    #[test]
    fn mark_suspended_blocks_writes() {
        let ring = running_ring(&[]);
        ring.mark(PcmState::Suspended);
        assert_eq!(ring.lock().check_writable(), Err(PcmError::Suspended));
        ring.restart();
        assert_eq!(ring.lock().state, PcmState::Prepared);
    }
}

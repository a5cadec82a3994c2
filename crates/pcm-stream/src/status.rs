use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::DeviceParams;
use crate::source::SourceInfo;

/// Why a session's playback ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackEndReason {
    /// The source ran out and everything queued was played.
    Eof,
    /// `stop()` (or dropping the session) cancelled playback.
    Stopped,
    /// A fatal device error ended playback.
    Error,
}

impl fmt::Display for PlaybackEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaybackEndReason::Eof => "eof",
            PlaybackEndReason::Stopped => "stopped",
            PlaybackEndReason::Error => "error",
        })
    }
}

/// Counters updated by the reader and player threads of one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub chunks_produced: AtomicU64,
    pub chunks_released: AtomicU64,
    /// Deepest the transfer queue got, in chunks.
    pub queue_high_water: AtomicU64,
    pub underruns: AtomicU64,
    pub suspends: AtomicU64,
    end_reason: Mutex<Option<PlaybackEndReason>>,
}

impl SessionStats {
    pub fn reset(&self) {
        for counter in [
            &self.bytes_read,
            &self.bytes_written,
            &self.chunks_produced,
            &self.chunks_released,
            &self.queue_high_water,
            &self.underruns,
            &self.suspends,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.set_end_reason(None);
    }

    pub fn note_queue_depth(&self, depth: usize) {
        self.queue_high_water.fetch_max(depth as u64, Ordering::Relaxed);
    }

    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        *self.end_reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_end_reason(&self, reason: Option<PlaybackEndReason>) {
        *self.end_reason.lock().unwrap_or_else(|e| e.into_inner()) = reason;
    }

    /// Copy the counters into a snapshot; descriptive fields are left empty.
    pub fn snapshot(&self) -> StatusSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatusSnapshot {
            running: false,
            path: None,
            source: None,
            device: None,
            params: None,
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            chunks_produced: load(&self.chunks_produced),
            chunks_released: load(&self.chunks_released),
            queue_high_water: load(&self.queue_high_water),
            underruns: load(&self.underruns),
            suspends: load(&self.suspends),
            end_reason: self.end_reason(),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub running: bool,
    pub path: Option<PathBuf>,
    pub source: Option<SourceInfo>,
    pub device: Option<String>,
    pub params: Option<DeviceParams>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunks_produced: u64,
    pub chunks_released: u64,
    pub queue_high_water: u64,
    pub underruns: u64,
    pub suspends: u64,
    pub end_reason: Option<PlaybackEndReason>,
}

impl StatusSnapshot {
    /// Seconds of audio handed to the device so far.
    pub fn elapsed_secs(&self) -> Option<f64> {
        let params = self.params?;
        if params.rate == 0 || params.bytes_per_frame == 0 {
            return None;
        }
        let frames = self.bytes_written / params.bytes_per_frame as u64;
        Some(frames as f64 / params.rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    #[test]
    fn snapshot_copies_counters_and_reason() {
        let stats = SessionStats::default();
        stats.bytes_read.store(10, Ordering::Relaxed);
        stats.note_queue_depth(2);
        stats.note_queue_depth(1);
        stats.set_end_reason(Some(PlaybackEndReason::Eof));
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 10);
        assert_eq!(snap.queue_high_water, 2);
        assert_eq!(snap.end_reason, Some(PlaybackEndReason::Eof));

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 0);
        assert_eq!(snap.end_reason, None);
    }

    #[test]
    fn elapsed_secs_uses_device_frames() {
        let mut snap = SessionStats::default().snapshot();
        assert_eq!(snap.elapsed_secs(), None);
        snap.bytes_written = 16_000;
        snap.params = Some(DeviceParams {
            format: SampleFormat::S16Le,
            channels: 1,
            rate: 8_000,
            bytes_per_frame: 2,
            bits_per_frame: 16,
            chunk_frames: 600,
            chunk_bytes: 1_200,
            buffer_frames: 2_400,
        });
        assert_eq!(snap.elapsed_secs(), Some(1.0));
    }
}

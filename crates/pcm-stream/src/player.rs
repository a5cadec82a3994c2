//! Player task: takes chunks off the transfer queue and writes them to the device.
//!
//! The task walks through explicit phases:
//!
//! ```text
//! Starting -> Streaming -> Draining -> Stopped
//!     \______________________/^
//! ```
//!
//! `Streaming` leaves for `Draining` on cancellation, end of stream or a fatal device error.
//! `Draining` always runs, so the reader is released and the device plays out what it holds.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use crate::config::StreamConfig;
use crate::device::PlaybackDevice;
use crate::error::DeviceError;
use crate::queue::{AudioChunk, SessionShared};
use crate::status::{PlaybackEndReason, SessionStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerPhase {
    Starting,
    Streaming,
    Draining,
    Stopped,
}

/// Returned by the player thread. Carries the device back so the controller can close it
/// after the join.
pub struct PlayerOutcome {
    pub device: PlaybackDevice,
    pub bytes_written: u64,
    pub chunks_written: u64,
    pub end_reason: PlaybackEndReason,
}

/// What one look at the shared state decided.
enum Step {
    Cancelled,
    Chunk(AudioChunk),
    Idle,
    Exhausted,
    Starved,
}

pub(crate) struct PlayerTask {
    pub device: PlaybackDevice,
    pub shared: Arc<SessionShared>,
    pub stats: Arc<SessionStats>,
    pub cfg: StreamConfig,
}

impl PlayerTask {
    pub(crate) fn run(mut self) -> PlayerOutcome {
        let mut phase = PlayerPhase::Starting;
        let mut end_reason = PlaybackEndReason::Stopped;
        let mut bytes_written = 0u64;
        let mut chunks_written = 0u64;
        let mut retries = 0u32;

        loop {
            phase = match phase {
                PlayerPhase::Starting => {
                    tracing::debug!(device = %self.device.name(), "player started");
                    if self.shared.is_playing() {
                        PlayerPhase::Streaming
                    } else {
                        PlayerPhase::Draining
                    }
                }
                PlayerPhase::Streaming => match self.next_step(chunks_written > 0) {
                    Step::Cancelled => {
                        end_reason = PlaybackEndReason::Stopped;
                        PlayerPhase::Draining
                    }
                    Step::Chunk(chunk) => {
                        let result = self.write_chunk(&chunk);
                        drop(chunk);
                        self.stats.chunks_released.fetch_add(1, Ordering::Relaxed);
                        match result {
                            Ok(n) => {
                                bytes_written += n;
                                chunks_written += 1;
                                PlayerPhase::Streaming
                            }
                            Err((n, DeviceError::Interrupted)) => {
                                bytes_written += n;
                                end_reason = PlaybackEndReason::Stopped;
                                PlayerPhase::Draining
                            }
                            Err((n, e)) => {
                                bytes_written += n;
                                tracing::error!(device = %self.device.name(), "playback failed: {e}");
                                end_reason = PlaybackEndReason::Error;
                                PlayerPhase::Draining
                            }
                        }
                    }
                    Step::Idle => {
                        thread::sleep(self.cfg.backpressure_sleep);
                        PlayerPhase::Streaming
                    }
                    Step::Exhausted => {
                        end_reason = PlaybackEndReason::Eof;
                        PlayerPhase::Draining
                    }
                    Step::Starved if retries < self.cfg.startup_retries => {
                        retries += 1;
                        thread::sleep(self.cfg.backpressure_sleep);
                        PlayerPhase::Streaming
                    }
                    Step::Starved => {
                        tracing::debug!("reader produced nothing");
                        end_reason = PlaybackEndReason::Eof;
                        PlayerPhase::Draining
                    }
                },
                PlayerPhase::Draining => {
                    self.drain();
                    PlayerPhase::Stopped
                }
                PlayerPhase::Stopped => break,
            };
        }

        self.stats.set_end_reason(Some(end_reason));
        tracing::debug!(
            bytes = bytes_written,
            chunks = chunks_written,
            reason = %end_reason,
            "player exited"
        );
        PlayerOutcome {
            device: self.device,
            bytes_written,
            chunks_written,
            end_reason,
        }
    }

    fn next_step(&self, played_any: bool) -> Step {
        let mut g = self.shared.lock();
        let step = if !g.playing {
            Step::Cancelled
        } else if let Some(chunk) = g.queue.pop_front() {
            g.more_wanted = true;
            Step::Chunk(chunk)
        } else if g.reading {
            g.more_wanted = true;
            Step::Idle
        } else if played_any {
            Step::Exhausted
        } else {
            Step::Starved
        };
        drop(g);
        self.shared.notify_all();
        step
    }

    /// Write one chunk in device-period slices. On error, also reports the bytes that did
    /// make it to the device.
    fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<u64, (u64, DeviceError)> {
        let Some(params) = self.device.params() else {
            return Err((0, DeviceError::NotConfigured));
        };
        let shared = self.shared.clone();
        let cancelled = move || !shared.is_playing();
        let mut written = 0u64;

        for slice in chunk.data.chunks(params.chunk_bytes) {
            if cancelled() {
                return Err((written, DeviceError::Interrupted));
            }
            let frames = slice.len() / params.bytes_per_frame;
            let result = self.device.write_cancellable(slice, frames, &cancelled);
            self.sync_recoveries();
            let n = result.map_err(|e| (written, e))?;
            let bytes = (n * params.bytes_per_frame) as u64;
            written += bytes;
            self.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        }
        Ok(written)
    }

    fn sync_recoveries(&self) {
        let r = self.device.recoveries();
        self.stats.underruns.store(r.underruns, Ordering::Relaxed);
        self.stats.suspends.store(r.suspends, Ordering::Relaxed);
    }

    fn drain(&mut self) {
        let discarded = self.shared.close_playing();
        if !discarded.is_empty() {
            tracing::debug!(chunks = discarded.len(), "discarding queued chunks");
            self.stats
                .chunks_released
                .fetch_add(discarded.len() as u64, Ordering::Relaxed);
        }
        drop(discarded);

        if self.device.params().is_none() {
            return;
        }
        if let Err(e) = self.device.drain() {
            tracing::warn!(device = %self.device.name(), "{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Fault, MemoryBackend};
    use crate::format::SampleFormat;
    use std::time::Duration;

    fn player(backend: MemoryBackend) -> (PlayerTask, Arc<SessionShared>, Arc<SessionStats>) {
        let cfg = StreamConfig {
            backpressure_sleep: Duration::from_millis(1),
            write_wait: Duration::from_millis(1),
            ..StreamConfig::default()
        };
        let mut device = PlaybackDevice::open_with(Box::new(backend), false)
            .unwrap()
            .with_config(&cfg);
        device.configure(SampleFormat::U8, 1, 8_000, 300_000).unwrap();
        let shared = Arc::new(SessionShared::new());
        shared.begin();
        let stats = Arc::new(SessionStats::default());
        let task = PlayerTask {
            device,
            shared: shared.clone(),
            stats: stats.clone(),
            cfg,
        };
        (task, shared, stats)
    }

    fn chunk(seq: u64, fill: u8, len: usize) -> AudioChunk {
        AudioChunk {
            data: vec![fill; len],
            seq,
        }
    }

    #[test]
    fn plays_queued_chunks_in_order_then_reports_eof() {
        let backend = MemoryBackend::new();
        let capture = backend.capture();
        let (task, shared, stats) = player(backend);
        shared.push(chunk(0, 1, 1_800)).unwrap();
        shared.push(chunk(1, 2, 600)).unwrap();
        shared.finish_reading();

        let outcome = task.run();
        assert_eq!(outcome.end_reason, PlaybackEndReason::Eof);
        assert_eq!(outcome.chunks_written, 2);
        assert_eq!(outcome.bytes_written, 2_400);
        let bytes = capture.bytes();
        assert!(bytes[..1_800].iter().all(|b| *b == 1));
        assert!(bytes[1_800..].iter().all(|b| *b == 2));
        assert_eq!(capture.drains(), 1);
        assert_eq!(stats.chunks_released.load(Ordering::Relaxed), 2);
        assert_eq!(stats.end_reason(), Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn cancelled_before_start_discards_queue() {
        let (task, shared, stats) = player(MemoryBackend::new());
        shared.push(chunk(0, 1, 600)).unwrap();
        shared.lock().playing = false;
        let outcome = task.run();
        assert_eq!(outcome.end_reason, PlaybackEndReason::Stopped);
        assert_eq!(outcome.chunks_written, 0);
        assert_eq!(stats.chunks_released.load(Ordering::Relaxed), 1);
        assert!(!shared.is_reading());
    }

    #[test]
    fn empty_stream_gives_up_after_startup_retries() {
        let backend = MemoryBackend::new();
        let capture = backend.capture();
        let (task, shared, _) = player(backend);
        shared.finish_reading();
        let outcome = task.run();
        assert_eq!(outcome.end_reason, PlaybackEndReason::Eof);
        assert_eq!(outcome.bytes_written, 0);
        assert_eq!(capture.writes(), 0);
    }

    #[test]
    fn fatal_device_error_releases_reader() {
        let backend = MemoryBackend::new().with_faults([Fault::Fatal("unplugged".to_string())]);
        let (task, shared, stats) = player(backend);
        shared.push(chunk(0, 1, 600)).unwrap();
        shared.push(chunk(1, 1, 600)).unwrap();
        let outcome = task.run();
        assert_eq!(outcome.end_reason, PlaybackEndReason::Error);
        assert!(!shared.is_reading());
        assert!(!shared.is_playing());
        assert_eq!(stats.chunks_released.load(Ordering::Relaxed), 2);
        assert!(!outcome.device.is_closed());
    }

    #[test]
    fn underruns_are_counted_in_stats() {
        let backend = MemoryBackend::new().with_faults([Fault::Underrun]);
        let (task, shared, stats) = player(backend);
        shared.push(chunk(0, 3, 600)).unwrap();
        shared.finish_reading();
        let outcome = task.run();
        assert_eq!(outcome.end_reason, PlaybackEndReason::Eof);
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 1);
    }
}

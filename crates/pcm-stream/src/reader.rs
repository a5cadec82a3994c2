//! Reader task: pulls chunks out of a [`WavSource`] and queues them for the player.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::queue::{AudioChunk, Demand, SessionShared};
use crate::source::WavSource;
use crate::status::SessionStats;

/// Why the reader stopped producing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderEnd {
    /// The declared data length was fully read.
    EndOfStream,
    /// The file ended early (or a read failed) mid-stream.
    ShortRead,
    /// `reading` was cleared by the player or the controller.
    Cancelled,
}

#[derive(Debug)]
pub struct ReaderOutcome {
    pub bytes_read: u64,
    pub chunks_produced: u64,
    pub end: ReaderEnd,
}

pub(crate) struct ReaderTask {
    pub source: WavSource,
    pub shared: Arc<SessionShared>,
    pub stats: Arc<SessionStats>,
    /// Bytes requested per chunk (a multiple of the device period).
    pub chunk_capacity: usize,
}

impl ReaderTask {
    pub(crate) fn run(mut self) -> ReaderOutcome {
        tracing::debug!(
            path = %self.source.path().display(),
            chunk_bytes = self.chunk_capacity,
            "reader started"
        );
        let mut outcome = ReaderOutcome {
            bytes_read: 0,
            chunks_produced: 0,
            end: ReaderEnd::Cancelled,
        };

        loop {
            if self.shared.wait_for_demand() == Demand::Stop {
                break;
            }
            let remaining = usize::try_from(self.source.remaining()).unwrap_or(usize::MAX);
            let request = self.source.frame_floor(self.chunk_capacity.min(remaining));
            if request == 0 {
                outcome.end = ReaderEnd::EndOfStream;
                break;
            }

            let mut data = vec![0u8; request];
            let got = self.source.read_chunk(&mut data);
            if got == 0 {
                outcome.end = ReaderEnd::ShortRead;
                break;
            }
            data.truncate(got);

            let chunk = AudioChunk {
                data,
                seq: outcome.chunks_produced,
            };
            outcome.bytes_read += got as u64;
            outcome.chunks_produced += 1;
            self.stats.bytes_read.fetch_add(got as u64, Ordering::Relaxed);
            self.stats.chunks_produced.fetch_add(1, Ordering::Relaxed);
            match self.shared.push(chunk) {
                Ok(depth) => self.stats.note_queue_depth(depth),
                Err(late) => {
                    drop(late);
                    self.stats.chunks_released.fetch_add(1, Ordering::Relaxed);
                    outcome.end = ReaderEnd::Cancelled;
                    break;
                }
            }

            if got < request {
                outcome.end = ReaderEnd::ShortRead;
                break;
            }
            if self.source.remaining() == 0 {
                outcome.end = ReaderEnd::EndOfStream;
                break;
            }
        }

        self.shared.finish_reading();
        self.source.close();
        tracing::debug!(
            bytes = outcome.bytes_read,
            chunks = outcome.chunks_produced,
            end = ?outcome.end,
            "reader exited"
        );
        outcome
    }
}

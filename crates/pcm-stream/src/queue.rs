//! Chunk hand-off between the reader and player threads.
//!
//! [`SessionShared`] is the only state the two tasks share. The queue, the `reading` and
//! `playing` flags and the demand latch all live under one mutex with one [`Condvar`] as a
//! general "state changed" signal:
//! - the reader appends chunks, but only after the player asked for more (`more_wanted`)
//! - the player pops chunks and re-arms the latch every time it takes one
//! - clearing a flag always wakes every waiter
//!
//! The latch is what keeps a wake-up sent before the reader started waiting from being lost.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// One block of raw PCM bytes moving from reader to player.
///
/// Chunks are moved, never cloned: the reader allocates them, the queue owns them while
/// queued, and the player drops them once written.
#[derive(Debug)]
pub struct AudioChunk {
    /// Valid bytes only; `data.len()` is the payload length.
    pub data: Vec<u8>,
    pub seq: u64,
}

impl AudioChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SharedState {
    pub queue: VecDeque<AudioChunk>,
    /// The reader is (or is about to be) producing chunks.
    pub reading: bool,
    /// The player is (or is about to be) consuming chunks.
    pub playing: bool,
    /// The player asked for data since the reader last looked.
    pub more_wanted: bool,
}

/// Lock and condition shared by one session's tasks.
#[derive(Debug, Default)]
pub struct SessionShared {
    state: Mutex<SharedState>,
    cond: Condvar,
}

/// What the reader should do after waiting for demand.
#[derive(Debug, PartialEq, Eq)]
pub enum Demand {
    Produce,
    Stop,
}

impl SessionShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Arm both flags for a new session and drop anything left over from the last one.
    pub fn begin(&self) -> usize {
        let mut g = self.lock();
        let stale = g.queue.len();
        g.queue.clear();
        g.reading = true;
        g.playing = true;
        g.more_wanted = true;
        stale
    }

    /// Clear both flags and wake every waiter.
    pub fn request_stop(&self) {
        let mut g = self.lock();
        g.reading = false;
        g.playing = false;
        drop(g);
        self.cond.notify_all();
    }

    /// Block until the player wants data or reading was cancelled. Consumes the latch.
    pub fn wait_for_demand(&self) -> Demand {
        let g = self.lock();
        let mut g = self
            .cond
            .wait_while(g, |s| s.reading && !s.more_wanted)
            .unwrap_or_else(|e| e.into_inner());
        g.more_wanted = false;
        if g.reading { Demand::Produce } else { Demand::Stop }
    }

    /// Append a chunk and wake the player. Returns the queue depth after the push, or the
    /// chunk itself if reading was cancelled while it was being filled.
    pub fn push(&self, chunk: AudioChunk) -> Result<usize, AudioChunk> {
        let mut g = self.lock();
        if !g.reading {
            return Err(chunk);
        }
        g.queue.push_back(chunk);
        let depth = g.queue.len();
        drop(g);
        self.cond.notify_all();
        Ok(depth)
    }

    /// Mark the reader as finished and wake everyone.
    pub fn finish_reading(&self) {
        let mut g = self.lock();
        g.reading = false;
        drop(g);
        self.cond.notify_all();
    }

    /// Player side: take the front chunk, re-arming the demand latch.
    pub fn pop(&self) -> Option<AudioChunk> {
        let mut g = self.lock();
        let chunk = g.queue.pop_front();
        g.more_wanted = true;
        drop(g);
        self.cond.notify_all();
        chunk
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn is_reading(&self) -> bool {
        self.lock().reading
    }

    /// Player side: stop consuming. Discards queued chunks, clears `playing` and, since no
    /// one will consume any more, `reading`. Returns the discarded chunks.
    pub fn close_playing(&self) -> Vec<AudioChunk> {
        let mut g = self.lock();
        let discarded: Vec<AudioChunk> = g.queue.drain(..).collect();
        g.playing = false;
        g.reading = false;
        drop(g);
        self.cond.notify_all();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn chunk(seq: u64, len: usize) -> AudioChunk {
        AudioChunk {
            data: vec![seq as u8; len],
            seq,
        }
    }

    #[test]
    fn begin_arms_flags_and_latch() {
        let shared = SessionShared::new();
        shared.lock().queue.push_back(chunk(0, 1));
        assert_eq!(shared.begin(), 1);
        let g = shared.lock();
        assert!(g.reading && g.playing && g.more_wanted);
        assert!(g.queue.is_empty());
    }

    #[test]
    fn demand_latch_survives_early_signal() {
        let shared = SessionShared::new();
        shared.begin();
        shared.lock().more_wanted = false;
        // Signal before anyone waits; the latch keeps it.
        assert!(shared.pop().is_none());
        assert_eq!(shared.wait_for_demand(), Demand::Produce);
        assert!(!shared.lock().more_wanted);
    }

    #[test]
    fn wait_for_demand_wakes_on_stop() {
        let shared = Arc::new(SessionShared::new());
        shared.begin();
        shared.lock().more_wanted = false;
        let waiter = {
            let shared = shared.clone();
            thread::spawn(move || shared.wait_for_demand())
        };
        thread::sleep(Duration::from_millis(20));
        shared.request_stop();
        assert_eq!(waiter.join().unwrap(), Demand::Stop);
    }

    #[test]
    fn queue_is_fifo() {
        let shared = SessionShared::new();
        shared.begin();
        for seq in 0..4 {
            assert_eq!(shared.push(chunk(seq, 8)).unwrap(), seq as usize + 1);
        }
        let order: Vec<u64> = std::iter::from_fn(|| shared.pop()).map(|c| c.seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn close_playing_discards_and_clears_both_flags() {
        let shared = SessionShared::new();
        shared.begin();
        shared.push(chunk(0, 4)).unwrap();
        shared.push(chunk(1, 4)).unwrap();
        let discarded = shared.close_playing();
        assert_eq!(discarded.len(), 2);
        assert!(!shared.is_playing());
        assert!(!shared.is_reading());
        assert!(shared.pop().is_none());
        // A chunk filled after cancellation is handed back.
        let late = shared.push(chunk(2, 4)).unwrap_err();
        assert_eq!(late.seq, 2);
    }
}

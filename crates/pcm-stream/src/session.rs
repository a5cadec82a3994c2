//! Session controller: one file, one device, one reader and one player thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::StreamConfig;
use crate::device::{BackendFactory, DeviceParams, PlaybackDevice, default_backend_factory};
use crate::error::SessionError;
use crate::player::{PlayerOutcome, PlayerTask};
use crate::queue::SessionShared;
use crate::reader::{ReaderOutcome, ReaderTask};
use crate::source::{SourceInfo, WavSource, is_wav_path};
use crate::status::{SessionStats, StatusSnapshot};

struct NowPlaying {
    path: PathBuf,
    source: SourceInfo,
    device: String,
    params: DeviceParams,
}

/// Plays one WAVE file at a time on one output device.
///
/// `play` starts two threads: a reader that pulls chunks from the file and a player that
/// writes them to the device. `stop` (or dropping the session) cancels both and returns
/// only after they exited and the device was closed.
pub struct Session {
    factory: BackendFactory,
    cfg: StreamConfig,
    shared: Option<Arc<SessionShared>>,
    stats: Arc<SessionStats>,
    reader: Option<JoinHandle<ReaderOutcome>>,
    player: Option<JoinHandle<PlayerOutcome>>,
    now_playing: Option<NowPlaying>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_backend_factory(default_backend_factory())
    }

    /// Use `factory` to turn device identifiers into backends.
    pub fn with_backend_factory(factory: BackendFactory) -> Self {
        Self {
            factory,
            cfg: StreamConfig::default(),
            shared: None,
            stats: Arc::new(SessionStats::default()),
            reader: None,
            player: None,
            now_playing: None,
        }
    }

    pub fn with_config(mut self, cfg: StreamConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Start playing `path` on `device_id`, stopping whatever this session played before.
    pub fn play(&mut self, path: impl AsRef<Path>, device_id: &str) -> Result<(), SessionError> {
        let path = path.as_ref();
        self.stop();

        if !is_wav_path(path) {
            return Err(SessionError::UnsupportedContainer(path.to_path_buf()));
        }
        let source = WavSource::open(path).map_err(|source| SessionError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let info = source.info().clone();

        let backend = (self.factory)(device_id)?;
        let mut device = PlaybackDevice::open_with(backend, self.cfg.nonblocking)?.with_config(&self.cfg);
        let params = match device.configure(
            info.sample_format,
            info.channels,
            info.sample_rate,
            self.cfg.max_ring_buffer_micros,
        ) {
            Ok(params) => params,
            Err(e) => {
                device.close();
                return Err(e.into());
            }
        };

        let shared = self
            .shared
            .get_or_insert_with(|| Arc::new(SessionShared::new()))
            .clone();
        let stale = shared.begin();
        if stale > 0 {
            tracing::debug!(chunks = stale, "dropped chunks left from previous run");
        }
        self.stats.reset();

        let reader = ReaderTask {
            source,
            shared: shared.clone(),
            stats: self.stats.clone(),
            chunk_capacity: params.chunk_bytes * self.cfg.chunk_periods.max(1),
        };
        let reader = thread::Builder::new()
            .name("pcm-reader".to_string())
            .spawn(move || reader.run())
            .map_err(|source| {
                shared.request_stop();
                SessionError::Spawn {
                    task: "reader",
                    source,
                }
            })?;

        let player = PlayerTask {
            device,
            shared: shared.clone(),
            stats: self.stats.clone(),
            cfg: self.cfg.clone(),
        };
        let player = match thread::Builder::new()
            .name("pcm-player".to_string())
            .spawn(move || player.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                shared.request_stop();
                if reader.join().is_err() {
                    tracing::error!("reader thread panicked");
                }
                return Err(SessionError::Spawn {
                    task: "player",
                    source,
                });
            }
        };

        tracing::info!(
            path = %path.display(),
            source = %info,
            device = %describe_device(&params, device_id),
            "session started"
        );
        self.reader = Some(reader);
        self.player = Some(player);
        self.now_playing = Some(NowPlaying {
            path: path.to_path_buf(),
            source: info,
            device: device_id.to_string(),
            params,
        });
        Ok(())
    }

    /// Cancel playback and wait for both threads. Safe to call at any time, any number of
    /// times.
    pub fn stop(&mut self) {
        if self.reader.is_none() && self.player.is_none() {
            return;
        }
        if let Some(shared) = &self.shared {
            shared.request_stop();
        }
        self.join_tasks();
    }

    /// Block until playback finishes on its own, then release the device.
    pub fn wait(&mut self) {
        self.join_tasks();
    }

    /// True while either task thread is still executing.
    pub fn is_running(&self) -> bool {
        alive(&self.reader) || alive(&self.player)
    }

    /// Join the tasks of a session that ended on its own and close its device. Returns
    /// false if there was nothing to reap or the session is still running.
    pub fn reap_finished(&mut self) -> bool {
        if (self.reader.is_none() && self.player.is_none()) || self.is_running() {
            return false;
        }
        self.join_tasks();
        true
    }

    pub fn status(&self) -> StatusSnapshot {
        let mut snap = self.stats.snapshot();
        snap.running = self.is_running();
        if let Some(np) = &self.now_playing {
            snap.path = Some(np.path.clone());
            snap.source = Some(np.source.clone());
            snap.device = Some(np.device.clone());
            snap.params = Some(np.params);
        }
        snap
    }

    fn join_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            match reader.join() {
                Ok(outcome) => tracing::debug!(
                    bytes = outcome.bytes_read,
                    chunks = outcome.chunks_produced,
                    end = ?outcome.end,
                    "reader joined"
                ),
                Err(_) => tracing::error!("reader thread panicked"),
            }
        }
        if let Some(player) = self.player.take() {
            match player.join() {
                Ok(mut outcome) => {
                    outcome.device.close();
                    tracing::info!(
                        path = %self.now_playing.as_ref().map(|np| np.path.display().to_string()).unwrap_or_default(),
                        elapsed_secs = self.status().elapsed_secs().unwrap_or(0.0),
                        bytes = outcome.bytes_written,
                        chunks = outcome.chunks_written,
                        reason = %outcome.end_reason,
                        "session finished"
                    );
                }
                Err(_) => tracing::error!("player thread panicked"),
            }
        }
        if let Some(shared) = &self.shared {
            let mut g = shared.lock();
            g.reading = false;
            g.playing = false;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn alive<T>(handle: &Option<JoinHandle<T>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

fn describe_device(params: &DeviceParams, device_id: &str) -> String {
    format!(
        "{device_id} ({} {}ch {} Hz, period {} frames)",
        params.format, params.channels, params.rate, params.chunk_frames
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CaptureHandle, MemoryBackend, PcmBackend};
    use crate::error::{DeviceError, OpenError};
    use crate::status::PlaybackEndReason;
    use crate::testutil::{WavSpec, ramp, write_wav};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Factory handing out paced memory sinks and remembering their captures.
    fn memory_factory(
        speed: f64,
        tweak: fn(MemoryBackend) -> MemoryBackend,
    ) -> (BackendFactory, Arc<Mutex<Vec<CaptureHandle>>>) {
        let captures = Arc::new(Mutex::new(Vec::new()));
        let seen = captures.clone();
        let factory: BackendFactory = Arc::new(move |_id: &str| -> Result<Box<dyn PcmBackend>, DeviceError> {
            let backend = tweak(MemoryBackend::new().with_pacing(speed));
            seen.lock().unwrap().push(backend.capture());
            Ok(Box::new(backend))
        });
        (factory, captures)
    }

    fn session(speed: f64) -> (Session, Arc<Mutex<Vec<CaptureHandle>>>) {
        let (factory, captures) = memory_factory(speed, |b| b);
        let cfg = StreamConfig {
            backpressure_sleep: Duration::from_millis(1),
            ..StreamConfig::default()
        };
        (Session::with_backend_factory(factory).with_config(cfg), captures)
    }

    fn last_capture(captures: &Arc<Mutex<Vec<CaptureHandle>>>) -> CaptureHandle {
        captures.lock().unwrap().last().cloned().unwrap()
    }

    #[test]
    fn plays_eight_bit_mono_file_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let data = ramp(8_000 * 3);
        let path = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &data);
        let (mut s, captures) = session(20.0);

        s.play(&path, "default").unwrap();
        assert!(s.is_running());
        s.wait();
        assert!(!s.is_running());

        let capture = last_capture(&captures);
        let bytes = capture.bytes();
        assert_eq!(&bytes[..data.len()], &data[..]);
        assert!(bytes[data.len()..].iter().all(|b| *b == 0x80));
        assert!(capture.is_closed());

        let status = s.status();
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Eof));
        assert_eq!(status.bytes_read, data.len() as u64);
        assert_eq!(status.bytes_written, data.len() as u64);
        assert_eq!(status.chunks_produced, status.chunks_released);
        assert_eq!(status.params.unwrap().chunk_bytes, 600);
    }

    #[test]
    fn unknown_format_tag_is_rejected_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = WavSpec::pcm(8_000, 1, 8);
        spec.format_tag = 0x0055;
        let path = write_wav(dir.path(), "mp3.wav", &spec, &[0u8; 64]);
        let (mut s, captures) = session(20.0);

        let err = s.play(&path, "default").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Open {
                source: OpenError::UnsupportedEncoding { tag: 0x0055, .. },
                ..
            }
        ));
        assert!(!s.is_running());
        assert!(captures.lock().unwrap().is_empty());
    }

    #[test]
    fn truncated_data_chunk_plays_whole_frames_only() {
        let dir = tempfile::tempdir().unwrap();
        let data = ramp(4_000);
        let path = write_wav(dir.path(), "t.wav", &WavSpec::pcm(8_000, 2, 16), &data);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 1]).unwrap();
        let (mut s, captures) = session(20.0);

        s.play(&path, "default").unwrap();
        s.wait();

        let bytes = last_capture(&captures).bytes();
        assert_eq!(&bytes[..3_996], &data[..3_996]);
        assert!(bytes[3_996..].iter().all(|b| *b == 0));
        let status = s.status();
        assert_eq!(status.bytes_written, 3_996);
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn non_wav_path_is_rejected() {
        let (mut s, _) = session(20.0);
        let err = s.play("track.flac", "default").unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedContainer(_)));
    }

    #[test]
    fn negotiation_failure_closes_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(800));
        let (factory, captures) = memory_factory(20.0, |b| b.with_degenerate_period());
        let mut s = Session::with_backend_factory(factory);

        let err = s.play(&path, "default").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Device(DeviceError::DegenerateGeometry { .. })
        ));
        assert!(!s.is_running());
        assert!(last_capture(&captures).is_closed());
    }

    #[test]
    fn stop_terminates_long_playback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "long.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(8_000 * 60));
        let (mut s, captures) = session(1.0);

        s.play(&path, "default").unwrap();
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        s.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!s.is_running());
        assert!(last_capture(&captures).is_closed());

        let status = s.status();
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Stopped));
        assert_eq!(status.chunks_produced, status.chunks_released);
        assert!(status.bytes_written < 8_000 * 60);
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(8_000));
        let (mut s, _) = session(20.0);
        s.stop();
        s.play(&path, "default").unwrap();
        s.stop();
        s.stop();
        assert!(!s.is_running());
    }

    #[test]
    fn play_again_reuses_session() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_wav(dir.path(), "1.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(8_000 * 30));
        let data = vec![0x11u8; 1_200];
        let second = write_wav(dir.path(), "2.wav", &WavSpec::pcm(8_000, 1, 8), &data);
        let (mut s, captures) = session(1.0);

        s.play(&first, "default").unwrap();
        thread::sleep(Duration::from_millis(20));
        s.play(&second, "default").unwrap();
        s.wait();

        let captures = captures.lock().unwrap();
        assert_eq!(captures.len(), 2);
        assert!(captures[0].is_closed());
        assert_eq!(&captures[1].bytes()[..1_200], &data[..]);
        assert_eq!(s.status().path.as_deref(), Some(second.as_path()));
    }

    #[test]
    fn concurrent_sessions_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = vec![0x10u8; 6_000];
        let b = vec![0x20u8; 9_000];
        let pa = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &a);
        let pb = write_wav(dir.path(), "b.wav", &WavSpec::pcm(8_000, 1, 8), &b);
        let (mut sa, ca) = session(20.0);
        let (mut sb, cb) = session(20.0);

        sa.play(&pa, "default").unwrap();
        sb.play(&pb, "default").unwrap();
        sa.wait();
        sb.wait();

        assert_eq!(&last_capture(&ca).bytes()[..a.len()], &a[..]);
        assert_eq!(&last_capture(&cb).bytes()[..b.len()], &b[..]);
    }

    #[test]
    fn stopping_one_session_leaves_the_other_running() {
        let dir = tempfile::tempdir().unwrap();
        let pa = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(8_000 * 30));
        let pb = write_wav(dir.path(), "b.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(8_000 * 30));
        let (mut sa, ca) = session(1.0);
        let (mut sb, cb) = session(1.0);

        sa.play(&pa, "default").unwrap();
        sb.play(&pb, "default").unwrap();
        thread::sleep(Duration::from_millis(50));
        sa.stop();

        assert!(!sa.is_running());
        assert!(sb.is_running());
        assert!(last_capture(&ca).is_closed());
        assert!(!last_capture(&cb).is_closed());
        assert_eq!(sa.status().end_reason, Some(PlaybackEndReason::Stopped));

        sb.stop();
        assert!(!sb.is_running());
    }

    #[test]
    fn reap_finished_closes_device_of_completed_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(800));
        let (mut s, captures) = session(20.0);
        assert!(!s.reap_finished());

        s.play(&path, "default").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while s.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!s.is_running());
        assert!(!last_capture(&captures).is_closed());

        assert!(s.reap_finished());
        assert!(last_capture(&captures).is_closed());
        assert!(!s.reap_finished());
        assert_eq!(s.status().end_reason, Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn drop_stops_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "long.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(8_000 * 60));
        let (mut s, captures) = session(1.0);
        s.play(&path, "default").unwrap();
        drop(s);
        assert!(last_capture(&captures).is_closed());
    }

    #[test]
    fn null_device_uses_default_factory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "a.wav", &WavSpec::pcm(8_000, 1, 8), &ramp(400));
        let mut s = Session::new();
        s.play(&path, "null").unwrap();
        s.wait();
        assert_eq!(s.status().bytes_written, 400);
    }
}

//! Command runtime: device listing and the interactive play loop.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use pcm_stream::device::host;
use pcm_stream::session::Session;

use crate::config::PlayConfig;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Why the play loop should stop waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Quit {
    /// `q` or `Q` on stdin.
    Key,
    /// Ctrl-C.
    Interrupt,
    /// Stdin reached end of file; keep playing until every session finishes.
    InputClosed,
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let names = host::list_devices().context("list output devices")?;
    for (i, name) in names.iter().enumerate() {
        println!("#{i}: {name}");
    }
    Ok(())
}

/// Play every file on its own session until the user quits.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let device = normalize_device_name(&config.device);
    let (quit_tx, quit_rx) = crossbeam_channel::unbounded();

    let ctrlc_tx = quit_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Quit::Interrupt);
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }
    spawn_stdin_watcher(quit_tx)?;

    let mut sessions = Vec::with_capacity(config.files.len());
    for path in &config.files {
        let mut session = Session::new().with_config(config.stream.clone());
        match session.play(path, &device) {
            Ok(()) => sessions.push(session),
            Err(e) => tracing::error!(path = %path.display(), "{e}"),
        }
    }
    tracing::info!(sessions = sessions.len(), device = %device, "playing; press q to quit");

    let reason = wait_for_quit(&quit_rx, &mut sessions);
    tracing::info!(reason = ?reason, "stopping");
    for session in &mut sessions {
        session.stop();
    }
    Ok(())
}

/// Block until a quit event arrives, reaping sessions that finished on their own. After
/// stdin closes, also return once no session is running any more.
fn wait_for_quit(quit_rx: &Receiver<Quit>, sessions: &mut [Session]) -> Quit {
    let mut input_closed = false;
    loop {
        reap_finished(sessions);
        if input_closed && !sessions.iter().any(Session::is_running) {
            // A session may have ended after the reap above.
            reap_finished(sessions);
            return Quit::InputClosed;
        }
        match quit_rx.recv_timeout(IDLE_POLL) {
            Ok(Quit::InputClosed) => input_closed = true,
            Ok(event) => return event,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Quit::InputClosed,
        }
    }
}

fn reap_finished(sessions: &mut [Session]) {
    for session in sessions.iter_mut() {
        if session.reap_finished() {
            let status = session.status();
            tracing::info!(
                path = %status.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
                elapsed_secs = status.elapsed_secs().unwrap_or(0.0),
                "finished"
            );
        }
    }
}

fn spawn_stdin_watcher(quit_tx: Sender<Quit>) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for byte in stdin.lock().bytes() {
                match byte {
                    Ok(b) if is_quit_key(b) => {
                        let _ = quit_tx.send(Quit::Key);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("stdin read error: {e}");
                        break;
                    }
                }
            }
            let _ = quit_tx.send(Quit::InputClosed);
        })
        .context("spawn stdin watcher")?;
    Ok(())
}

fn is_quit_key(b: u8) -> bool {
    matches!(b, b'q' | b'Q')
}

fn normalize_device_name(device: &str) -> String {
    match device.trim() {
        "" => "default".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_device_name_trims_and_defaults() {
        assert_eq!(normalize_device_name(""), "default");
        assert_eq!(normalize_device_name("   "), "default");
        assert_eq!(normalize_device_name("  USB DAC "), "USB DAC");
        assert_eq!(normalize_device_name("USB  DAC"), "USB  DAC");
    }

    #[test]
    fn quit_keys_are_case_insensitive() {
        assert!(is_quit_key(b'q'));
        assert!(is_quit_key(b'Q'));
        assert!(!is_quit_key(b'\n'));
    }

    #[test]
    fn wait_for_quit_returns_first_key_event() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Quit::Key).unwrap();
        assert_eq!(wait_for_quit(&rx, &mut []), Quit::Key);
    }

    #[test]
    fn closed_input_waits_for_sessions_then_returns() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Quit::InputClosed).unwrap();
        assert_eq!(wait_for_quit(&rx, &mut []), Quit::InputClosed);
    }

    fn write_u8_mono_wav(path: &std::path::Path, frames: usize) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + frames as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 0, 1, 0]);
        bytes.extend_from_slice(&8_000u32.to_le_bytes());
        bytes.extend_from_slice(&8_000u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 0, 8, 0]);
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(frames as u32).to_le_bytes());
        bytes.extend(std::iter::repeat_n(0x80u8, frames));
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn closed_input_reaps_finished_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_u8_mono_wav(&path, 400);

        let mut session = Session::new();
        session.play(&path, "null").unwrap();
        let mut sessions = vec![session];

        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Quit::InputClosed).unwrap();
        assert_eq!(wait_for_quit(&rx, &mut sessions), Quit::InputClosed);
        assert!(!sessions[0].is_running());
        assert!(!sessions[0].reap_finished());
        assert_eq!(sessions[0].status().bytes_written, 400);
    }
}

//! Sweep stimulus playback
//!
//! Workers only see [`MediaPlayer`]: `play(file, on_finished)` and `stop()`.
//! The backend is picked from `[playback] backend` at startup.
//!
//! Contract shared by every backend:
//! - `on_finished` fires exactly once per `play` call, whether playback
//!   ends naturally, is stopped, is replaced by a newer `play`, or fails to
//!   start.
//! - Starting a new play stops the previous one first.

mod library;
mod process;

pub use library::LibraryPlayer;
pub use process::ProcessPlayer;

use rmc_common::config::{PlaybackBackend, PlaybackConfig};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::Result;

/// Callback invoked when a play call ends
pub type OnFinished = Box<dyn FnOnce() + Send + 'static>;

/// Stimulus file extensions recognized by [`find_sweep_file`]
pub const STIMULUS_EXTENSIONS: [&str; 5] = ["mlp", "mp4", "mp3", "wav", "flac"];

/// Media playback collaborator
pub trait MediaPlayer: Send + Sync {
    /// Start playing `file`; `on_finished` fires once when playback ends
    fn play(&self, file: &Path, on_finished: OnFinished) -> Result<()>;

    /// Stop the current playback, if any
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Wraps an [`OnFinished`] so it fires exactly once
///
/// Fires on [`FinishGuard::fire`] or, failing that, when dropped.
pub struct FinishGuard {
    callback: Mutex<Option<OnFinished>>,
}

impl FinishGuard {
    pub fn new(callback: OnFinished) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    pub fn fire(&self) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Player that finishes immediately without producing audio
#[derive(Debug, Default)]
pub struct NullPlayer;

impl MediaPlayer for NullPlayer {
    fn play(&self, file: &Path, on_finished: OnFinished) -> Result<()> {
        debug!("NullPlayer: skipping {}", file.display());
        on_finished();
        Ok(())
    }

    fn stop(&self) {}

    fn is_playing(&self) -> bool {
        false
    }
}

/// Build the configured playback backend
pub fn player_from_config(config: &PlaybackConfig) -> Arc<dyn MediaPlayer> {
    match config.backend {
        PlaybackBackend::Process => {
            let program = config
                .player_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("vlc"));
            info!("Playback backend: external process ({})", program.display());
            Arc::new(ProcessPlayer::new(program, config.show_gui))
        }
        PlaybackBackend::Library => {
            info!("Playback backend: in-process audio output");
            Arc::new(LibraryPlayer::new())
        }
        PlaybackBackend::None => {
            info!("Playback backend: none (sweeps are not played)");
            Arc::new(NullPlayer)
        }
    }
}

/// Stimulus token for a channel; subwoofer channels share the LFE sweep
pub fn stimulus_token(channel: &str) -> String {
    if channel.to_ascii_uppercase().contains("SW") {
        "LFE".to_string()
    } else {
        channel.to_string()
    }
}

/// True when `token` appears in `name` bounded by non-alphanumerics or the
/// ends of the string (case-insensitive)
fn contains_delimited_token(name: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let name = name.to_ascii_lowercase();
    let token = token.to_ascii_lowercase();
    let bytes = name.as_bytes();

    let mut start = 0;
    while let Some(offset) = name[start..].find(&token) {
        let begin = start + offset;
        let end = begin + token.len();
        let before_ok = begin == 0 || !bytes[begin - 1].is_ascii_alphanumeric();
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = begin + 1;
    }
    false
}

/// Locate the sweep stimulus for `channel` in `dir`
///
/// Candidates are sorted by file name so the choice is stable.
pub fn find_sweep_file(dir: &Path, channel: &str) -> Option<PathBuf> {
    let token = stimulus_token(channel);
    let entries = std::fs::read_dir(dir).ok()?;

    let mut matches: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    STIMULUS_EXTENSIONS
                        .iter()
                        .any(|known| known.eq_ignore_ascii_case(ext))
                })
                .unwrap_or(false)
        })
        .filter(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(|stem| contains_delimited_token(stem, &token))
                .unwrap_or(false)
        })
        .collect();

    matches.sort();
    matches.into_iter().next()
}

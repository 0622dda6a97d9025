//! External player process backend

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{FinishGuard, MediaPlayer, OnFinished};
use crate::error::{Error, Result};

struct Running {
    generation: u64,
    stop_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    generation: u64,
    running: Option<Running>,
}

/// Plays stimuli by launching an external player
///
/// The player is run with `--play-and-exit` and, unless the GUI is
/// requested, `--intf dummy`. Must be used from within a tokio runtime.
pub struct ProcessPlayer {
    program: PathBuf,
    show_gui: bool,
    state: Arc<Mutex<State>>,
}

impl ProcessPlayer {
    pub fn new(program: PathBuf, show_gui: bool) -> Self {
        Self {
            program,
            show_gui,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Arguments passed to the player for `file`
    pub fn args_for(&self, file: &Path) -> Vec<String> {
        let mut args = vec!["--play-and-exit".to_string()];
        if !self.show_gui {
            args.push("--intf".to_string());
            args.push("dummy".to_string());
        }
        args.push(file.to_string_lossy().into_owned());
        args
    }
}

impl MediaPlayer for ProcessPlayer {
    fn play(&self, file: &Path, on_finished: OnFinished) -> Result<()> {
        let guard = FinishGuard::new(on_finished);
        self.stop();

        let mut child = Command::new(&self.program)
            .args(self.args_for(file))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Playback(format!("Failed to launch {}: {}", self.program.display(), e))
            })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let generation = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.generation += 1;
            state.running = Some(Running {
                generation: state.generation,
                stop_tx,
            });
            state.generation
        };

        info!("Playing {} via {}", file.display(), self.program.display());

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => debug!("Player exited: {}", status),
                        Err(e) => warn!("Failed to wait for player: {}", e),
                    }
                }
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill player: {}", e);
                    }
                }
            }

            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.running.as_ref().map(|r| r.generation) == Some(generation) {
                    state.running = None;
                }
            }
            guard.fire();
        });

        Ok(())
    }

    fn stop(&self) {
        let running = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
            .take();
        if let Some(running) = running {
            debug!("Stopping player process");
            let _ = running.stop_tx.send(());
        }
    }

    fn is_playing(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
            .is_some()
    }
}

//! RTA verification
//!
//! [`RtaCoordinator`] collects distortion samples pushed by the webhook
//! listener into a time window. [`RtaVerifier`] drives one verification run:
//! it starts RTA on the device, plays the channel's sweep, finalizes the
//! window and folds the window statistics into the capture's quality entry.
//!
//! A window with fewer than `min_samples` samples is discarded and the
//! capture keeps its unverified result.

use chrono::Utc;
use rmc_common::config::RtaConfig;
use rmc_common::events::{EventBus, RmcEvent};
use rmc_common::QualityResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::MeasurementDevice;
use crate::error::{Error, Result};
use crate::playback::{find_sweep_file, MediaPlayer};

/// Delay between starting RTA on the device and opening the window
const RTA_WARMUP: Duration = Duration::from_millis(500);

/// How often the verifier checks whether the window is already complete
const WINDOW_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Fundamental levels further than this from the window median are unstable
const STABLE_FUNDAMENTAL_DB: f64 = 6.0;

/// One distortion sample reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionSample {
    pub thd_percent: f64,
    pub fundamental_dbfs: f64,
    #[serde(default)]
    pub noise_dbfs: Option<f64>,
}

/// Statistics over a finalized window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtaSummary {
    pub sample_count: usize,
    /// Samples whose fundamental level sits near the window median
    pub stable_samples: usize,
    pub mean_thd_percent: f64,
    pub max_thd_percent: f64,
    pub median_fundamental_dbfs: f64,
    pub mean_noise_dbfs: Option<f64>,
    pub elapsed_secs: f64,
}

impl RtaSummary {
    fn from_samples(samples: &[DistortionSample], elapsed: Duration) -> Self {
        let count = samples.len();
        let mean_thd = samples.iter().map(|s| s.thd_percent).sum::<f64>() / count as f64;
        let max_thd = samples
            .iter()
            .map(|s| s.thd_percent)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut fundamentals: Vec<f64> = samples.iter().map(|s| s.fundamental_dbfs).collect();
        fundamentals.sort_by(|a, b| a.total_cmp(b));
        let median = if count % 2 == 1 {
            fundamentals[count / 2]
        } else {
            (fundamentals[count / 2 - 1] + fundamentals[count / 2]) / 2.0
        };

        let stable = samples
            .iter()
            .filter(|s| (s.fundamental_dbfs - median).abs() <= STABLE_FUNDAMENTAL_DB)
            .count();

        let noise: Vec<f64> = samples.iter().filter_map(|s| s.noise_dbfs).collect();
        let mean_noise = if noise.is_empty() {
            None
        } else {
            Some(noise.iter().sum::<f64>() / noise.len() as f64)
        };

        Self {
            sample_count: count,
            stable_samples: stable,
            mean_thd_percent: mean_thd,
            max_thd_percent: max_thd,
            median_fundamental_dbfs: median,
            mean_noise_dbfs: mean_noise,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    /// Copy of `initial` with the window statistics merged into `detail`
    pub fn apply_to(&self, initial: &QualityResult) -> QualityResult {
        let mut result = initial.clone();
        result.detail.insert("rta_sample_count".to_string(), self.sample_count as f64);
        result
            .detail
            .insert("rta_stable_samples".to_string(), self.stable_samples as f64);
        result
            .detail
            .insert("rta_mean_thd_percent".to_string(), self.mean_thd_percent);
        result
            .detail
            .insert("rta_max_thd_percent".to_string(), self.max_thd_percent);
        result.detail.insert(
            "rta_median_fundamental_dbfs".to_string(),
            self.median_fundamental_dbfs,
        );
        if let Some(noise) = self.mean_noise_dbfs {
            result.detail.insert("rta_mean_noise_dbfs".to_string(), noise);
        }
        result.verified = true;
        result
    }
}

#[derive(Debug)]
struct RtaWindow {
    samples: Vec<DistortionSample>,
    started: Instant,
    duration: Duration,
}

/// Windowed collector for pushed distortion samples
#[derive(Debug)]
pub struct RtaCoordinator {
    window: Mutex<Option<RtaWindow>>,
    min_samples: usize,
}

impl RtaCoordinator {
    pub fn new(min_samples: usize) -> Self {
        Self {
            window: Mutex::new(None),
            min_samples,
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RtaWindow>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a fresh window, discarding any previous one
    pub fn start_collection(&self, duration: Duration) {
        debug!("RTA window opened for {:?}", duration);
        *self.lock() = Some(RtaWindow {
            samples: Vec::new(),
            started: Instant::now(),
            duration,
        });
    }

    /// Append a sample; returns false if no window is open
    pub fn push_sample(&self, sample: DistortionSample) -> bool {
        match self.lock().as_mut() {
            Some(window) => {
                window.samples.push(sample);
                true
            }
            None => {
                debug!("Dropping RTA sample: no window open");
                false
            }
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.lock().is_some()
    }

    pub fn sample_count(&self) -> usize {
        self.lock().as_ref().map(|w| w.samples.len()).unwrap_or(0)
    }

    /// True once the window has run its full duration with enough samples
    pub fn is_complete(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|w| w.started.elapsed() >= w.duration && w.samples.len() >= self.min_samples)
            .unwrap_or(false)
    }

    /// Close the window
    ///
    /// Returns `None` if no window was open or it holds fewer than
    /// `min_samples` samples.
    pub fn stop_collection(&self) -> Option<RtaSummary> {
        let window = self.lock().take()?;
        let count = window.samples.len();
        if count < self.min_samples {
            info!(
                "RTA window closed with {} samples ({} required)",
                count, self.min_samples
            );
            return None;
        }
        Some(RtaSummary::from_samples(
            &window.samples,
            window.started.elapsed(),
        ))
    }
}

/// Result of one verification run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtaOutcome {
    pub result: QualityResult,
    pub verified: bool,
    pub summary: Option<RtaSummary>,
}

/// Why the window was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finalize {
    PlaybackFinished,
    WindowComplete,
    Ceiling,
}

/// Drives one RTA verification run
pub struct RtaVerifier {
    device: Arc<dyn MeasurementDevice>,
    player: Arc<dyn MediaPlayer>,
    rta: Arc<RtaCoordinator>,
    events: EventBus,
    config: RtaConfig,
    stimulus_dir: Option<PathBuf>,
    callback_url: String,
}

impl RtaVerifier {
    pub fn new(
        device: Arc<dyn MeasurementDevice>,
        player: Arc<dyn MediaPlayer>,
        rta: Arc<RtaCoordinator>,
        events: EventBus,
        config: RtaConfig,
        stimulus_dir: Option<PathBuf>,
        callback_url: String,
    ) -> Self {
        Self {
            device,
            player,
            rta,
            events,
            config,
            stimulus_dir,
            callback_url,
        }
    }

    fn status(&self, message: impl Into<String>) {
        self.events.emit_lossy(RmcEvent::status(message));
    }

    /// Verify `initial` with an RTA window
    ///
    /// Device and playback setup failures are errors; an unusable window is
    /// not, and yields `initial` unchanged with `verified = false`.
    pub async fn verify(
        &self,
        initial: QualityResult,
        cancel: CancellationToken,
    ) -> Result<RtaOutcome> {
        let channel = initial.key.channel().to_string();
        let stimulus = self
            .stimulus_dir
            .as_deref()
            .and_then(|dir| find_sweep_file(dir, &channel))
            .ok_or_else(|| Error::StimulusMissing(channel.clone()))?;

        self.status(format!("Starting RTA verification for {}...", channel));
        self.device
            .subscribe_rta_distortion(&self.callback_url)
            .await?;

        let outcome = self.run_window(&initial, stimulus, &cancel).await;

        // Always release the device, whatever happened above
        self.player.stop();
        self.rta.stop_collection();
        if let Err(e) = self.device.stop_rta().await {
            warn!("RTA cleanup: failed to stop RTA: {}", e);
        }
        if let Err(e) = self.device.unsubscribe_rta_distortion().await {
            warn!("RTA cleanup: failed to unsubscribe: {}", e);
        }

        let outcome = outcome?;
        self.events.emit_lossy(RmcEvent::RtaVerificationComplete {
            result: outcome.result.clone(),
            verified: outcome.verified,
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }

    async fn run_window(
        &self,
        initial: &QualityResult,
        stimulus: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<RtaOutcome> {
        if let Err(e) = self.device.configure_rta().await {
            // The device keeps its previous configuration; carry on
            warn!("Failed to configure RTA: {}", e);
            self.events.emit_lossy(RmcEvent::error_notice(
                "RTA Error",
                format!("Failed to set RTA configuration: {}", e),
            ));
        }
        self.device.start_rta().await?;
        tokio::time::sleep(RTA_WARMUP).await;

        let duration = self.config.duration();
        self.rta.start_collection(duration);
        self.status("Collecting RTA distortion data...");

        let (finished_tx, finished_rx) = oneshot::channel();
        self.status(format!("Playing verification sweep for {}", initial.key.channel()));
        self.player.play(
            &stimulus,
            Box::new(move || {
                let _ = finished_tx.send(());
            }),
        )?;

        let settle = self.config.settle();
        let playback_done = async move {
            let _ = finished_rx.await;
            tokio::time::sleep(settle).await;
        };
        let window_complete = async {
            let mut interval = tokio::time::interval(WINDOW_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                if self.rta.is_complete() {
                    break;
                }
            }
        };

        let reason = tokio::select! {
            _ = playback_done => Finalize::PlaybackFinished,
            _ = window_complete => Finalize::WindowComplete,
            _ = tokio::time::sleep(duration + self.config.grace()) => Finalize::Ceiling,
            _ = cancel.cancelled() => {
                return Err(Error::CoordinatorAbort(format!("RTA verification of {}", initial.key)));
            }
        };

        match reason {
            Finalize::PlaybackFinished => {
                self.status("Playback complete, finalizing RTA collection...")
            }
            Finalize::WindowComplete => debug!("RTA window complete before playback ended"),
            Finalize::Ceiling => self.status("RTA verification timed out"),
        }

        let collected = self.rta.sample_count();
        match self.rta.stop_collection() {
            Some(summary) => {
                self.status(format!(
                    "RTA verification complete: {} samples analyzed",
                    summary.sample_count
                ));
                Ok(RtaOutcome {
                    result: summary.apply_to(initial),
                    verified: true,
                    summary: Some(summary),
                })
            }
            None => {
                let err = Error::RtaInsufficientSamples {
                    collected,
                    required: self.rta.min_samples(),
                };
                warn!("{}", err);
                self.events.emit_lossy(RmcEvent::warning(format!(
                    "RTA verification failed - insufficient data ({})",
                    err
                )));
                Ok(RtaOutcome {
                    result: initial.clone(),
                    verified: false,
                    summary: None,
                })
            }
        }
    }
}

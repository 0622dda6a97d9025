//! Scripted collaborators shared by the integration tests
//!
//! `ScriptedDevice` answers start requests by signaling the attached
//! coordinator after a fixed delay, the way the real device answers through
//! the webhook. All timing runs on tokio's paused clock.

#![allow(dead_code)]

use async_trait::async_trait;
use rmc_common::config::RmcConfig;
use rmc_common::events::{EventBus, RmcEvent};
use rmc_common::{MeasurementKey, Rating};
use rmc_coord::coordinator::{Coordinator, CoordinatorKey, CoordinatorStatus, ProcessStage};
use rmc_coord::device::{DeviceError, DeviceMeasurement, MeasurementDevice};
use rmc_coord::metrics::{Evaluation, MetricsEvaluator};
use rmc_coord::playback::{MediaPlayer, OnFinished};
use rmc_coord::workers::{SharedSnapshot, WorkerContext};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How the fake device answers one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Job completes after the device delay
    Succeed,
    /// Device reports an error with this message
    Fail(String),
    /// Device accepts the job and never calls back
    Silent,
    /// Start request itself fails
    RejectStart,
}

/// Process request seen by the fake device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCall {
    pub channel: String,
    pub stage: ProcessStage,
    pub ids: Vec<String>,
}

#[derive(Default)]
struct DeviceState {
    coordinator: Option<Arc<Coordinator>>,
    capture_script: HashMap<MeasurementKey, VecDeque<Reply>>,
    process_script: HashMap<(String, ProcessStage), VecDeque<Reply>>,
    listing: Vec<DeviceMeasurement>,
    captures: Vec<MeasurementKey>,
    processes: Vec<ProcessCall>,
    deleted: Vec<String>,
    renamed: Vec<(String, String)>,
    rta_calls: Vec<&'static str>,
    next_id: u32,
}

pub struct ScriptedDevice {
    state: Mutex<DeviceState>,
    delay: Duration,
    pub cancels: AtomicU32,
    /// How long each cancel request takes to be acknowledged
    pub cancel_delay_ms: AtomicU64,
    pub listing_fails: AtomicBool,
    pub rename_fails: AtomicBool,
}

impl ScriptedDevice {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            delay,
            cancels: AtomicU32::new(0),
            cancel_delay_ms: AtomicU64::new(0),
            listing_fails: AtomicBool::new(false),
            rename_fails: AtomicBool::new(false),
        }
    }

    /// Coordinator the fake "webhook" signals
    pub fn attach(&self, coordinator: Arc<Coordinator>) {
        self.state.lock().unwrap().coordinator = Some(coordinator);
    }

    pub fn script_capture(&self, key: MeasurementKey, replies: Vec<Reply>) {
        self.state
            .lock()
            .unwrap()
            .capture_script
            .insert(key, replies.into());
    }

    pub fn script_process(&self, channel: &str, stage: ProcessStage, replies: Vec<Reply>) {
        self.state
            .lock()
            .unwrap()
            .process_script
            .insert((channel.to_string(), stage), replies.into());
    }

    /// Pre-existing listing entry
    pub fn add_measurement(&self, uuid: &str, title: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let index = state.next_id;
        state.listing.push(DeviceMeasurement {
            index,
            uuid: uuid.to_string(),
            title: title.to_string(),
        });
    }

    pub fn captures(&self) -> Vec<MeasurementKey> {
        self.state.lock().unwrap().captures.clone()
    }

    pub fn processes(&self) -> Vec<ProcessCall> {
        self.state.lock().unwrap().processes.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn renamed(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().renamed.clone()
    }

    pub fn rta_calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().rta_calls.clone()
    }

    /// Pop the next reply and, unless the start fails, schedule the callback
    fn answer(
        &self,
        reply: Reply,
        key: CoordinatorKey,
        artifact_title: Option<String>,
    ) -> Result<(), DeviceError> {
        let coordinator = self.state.lock().unwrap().coordinator.clone();
        let (status, message) = match reply {
            Reply::RejectStart => {
                return Err(DeviceError::Network("connection refused".to_string()))
            }
            Reply::Silent => return Ok(()),
            Reply::Succeed => (CoordinatorStatus::Success, None),
            Reply::Fail(message) => (CoordinatorStatus::Error, Some(message)),
        };

        if status == CoordinatorStatus::Success {
            if let Some(title) = artifact_title {
                let mut state = self.state.lock().unwrap();
                state.next_id += 1;
                let index = state.next_id;
                state.listing.push(DeviceMeasurement {
                    index,
                    uuid: format!("m{}", index),
                    title,
                });
            }
        }

        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = coordinator {
                coordinator.signal_matching(&key, status, message);
            }
        });
        Ok(())
    }
}

#[async_trait]
impl MeasurementDevice for ScriptedDevice {
    async fn subscribe(&self, _callback_url: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn start_capture(&self, key: &MeasurementKey) -> Result<(), DeviceError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.captures.push(key.clone());
            state
                .capture_script
                .get_mut(key)
                .and_then(|replies| replies.pop_front())
                .unwrap_or(Reply::Succeed)
        };
        self.answer(reply, CoordinatorKey::capture(key.clone()), Some(key.title()))
    }

    async fn cancel_capture(&self) -> Result<(), DeviceError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let delay = self.cancel_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn get_all_measurements(&self) -> Result<Vec<DeviceMeasurement>, DeviceError> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::Network("connection refused".to_string()));
        }
        Ok(self.state.lock().unwrap().listing.clone())
    }

    async fn delete_measurement(&self, id: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(id.to_string());
        state.listing.retain(|m| m.uuid != id);
        Ok(())
    }

    async fn rename_measurement(&self, id: &str, title: &str) -> Result<(), DeviceError> {
        if self.rename_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::Api {
                status: 500,
                body: "rename failed".to_string(),
            });
        }
        self.state
            .lock()
            .unwrap()
            .renamed
            .push((id.to_string(), title.to_string()));
        Ok(())
    }

    async fn start_cross_corr_align(
        &self,
        channel: &str,
        ids: &[String],
    ) -> Result<(), DeviceError> {
        self.start_process(channel, ProcessStage::CrossCorrAlign, ids)
    }

    async fn start_vector_average(&self, channel: &str, ids: &[String]) -> Result<(), DeviceError> {
        self.start_process(channel, ProcessStage::VectorAverage, ids)
    }

    async fn subscribe_rta_distortion(&self, _callback_url: &str) -> Result<(), DeviceError> {
        self.state.lock().unwrap().rta_calls.push("subscribe");
        Ok(())
    }

    async fn unsubscribe_rta_distortion(&self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().rta_calls.push("unsubscribe");
        Ok(())
    }

    async fn configure_rta(&self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().rta_calls.push("configure");
        Ok(())
    }

    async fn start_rta(&self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().rta_calls.push("start");
        Ok(())
    }

    async fn stop_rta(&self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().rta_calls.push("stop");
        Ok(())
    }
}

impl ScriptedDevice {
    fn start_process(
        &self,
        channel: &str,
        stage: ProcessStage,
        ids: &[String],
    ) -> Result<(), DeviceError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.processes.push(ProcessCall {
                channel: channel.to_string(),
                stage,
                ids: ids.to_vec(),
            });
            state
                .process_script
                .get_mut(&(channel.to_string(), stage))
                .and_then(|replies| replies.pop_front())
                .unwrap_or(Reply::Succeed)
        };
        let artifact = match stage {
            ProcessStage::VectorAverage => Some("Vector average".to_string()),
            ProcessStage::CrossCorrAlign => None,
        };
        self.answer(reply, CoordinatorKey::process(channel, stage), artifact)
    }
}

/// Player that records plays and reports completion after a delay
pub struct RecordingPlayer {
    pub plays: Mutex<Vec<PathBuf>>,
    pub stops: AtomicU32,
    finish_after: Option<Duration>,
}

impl RecordingPlayer {
    /// `None` finishes synchronously inside `play`
    pub fn new(finish_after: Option<Duration>) -> Self {
        Self {
            plays: Mutex::new(Vec::new()),
            stops: AtomicU32::new(0),
            finish_after,
        }
    }

    pub fn plays(&self) -> Vec<PathBuf> {
        self.plays.lock().unwrap().clone()
    }
}

impl MediaPlayer for RecordingPlayer {
    fn play(&self, file: &Path, on_finished: OnFinished) -> rmc_coord::Result<()> {
        self.plays.lock().unwrap().push(file.to_path_buf());
        match self.finish_after {
            None => on_finished(),
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    on_finished();
                });
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        false
    }
}

/// Evaluator that hands out ratings in order, then PASS
#[derive(Default)]
pub struct ScriptedEvaluator {
    ratings: Mutex<VecDeque<Rating>>,
    pub evaluated: Mutex<Vec<String>>,
}

impl ScriptedEvaluator {
    pub fn new(ratings: Vec<Rating>) -> Self {
        Self {
            ratings: Mutex::new(ratings.into()),
            evaluated: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MetricsEvaluator for ScriptedEvaluator {
    async fn evaluate(&self, artifact_id: &str) -> rmc_coord::Result<Evaluation> {
        self.evaluated.lock().unwrap().push(artifact_id.to_string());
        let rating = self.ratings.lock().unwrap().pop_front().unwrap_or(Rating::Pass);
        let score = match rating {
            Rating::Pass => 90.0,
            Rating::Caution => 60.0,
            Rating::Retake => 20.0,
        };
        Ok(Evaluation {
            rating,
            score,
            detail: BTreeMap::from([("snr_db".to_string(), 40.0)]),
        })
    }
}

/// Defaults with playback off and no first-position prompt
pub fn test_config() -> RmcConfig {
    let mut config = RmcConfig::default();
    config.sweep.prompt_first_position = false;
    config.playback.stimulus_dir = None;
    config
}

/// Everything a worker test needs, wired together
pub struct Harness {
    pub device: Arc<ScriptedDevice>,
    pub player: Arc<RecordingPlayer>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub coordinator: Arc<Coordinator>,
    pub events: EventBus,
    pub snapshot: SharedSnapshot,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(ratings: Vec<Rating>) -> Self {
        let device = Arc::new(ScriptedDevice::new(Duration::from_secs(1)));
        let coordinator = Arc::new(Coordinator::new());
        device.attach(Arc::clone(&coordinator));
        Self {
            device,
            player: Arc::new(RecordingPlayer::new(None)),
            evaluator: Arc::new(ScriptedEvaluator::new(ratings)),
            coordinator,
            events: EventBus::new(4096),
            snapshot: SharedSnapshot::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn context(&self, config: RmcConfig) -> WorkerContext {
        WorkerContext {
            session_id: Uuid::new_v4(),
            device: self.device.clone(),
            player: self.player.clone(),
            evaluator: self.evaluator.clone(),
            coordinator: Arc::clone(&self.coordinator),
            events: self.events.clone(),
            config: Arc::new(config),
            cancel: self.cancel.clone(),
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

/// Drain everything currently buffered on `rx`
pub fn drain(rx: &mut broadcast::Receiver<RmcEvent>) -> Vec<RmcEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Status line texts among `events`
pub fn status_lines(events: &[RmcEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RmcEvent::StatusUpdate { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

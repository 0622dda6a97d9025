//! Single-slot rendezvous between the webhook listener and a polling worker
//!
//! A worker arms the slot with [`Coordinator::reset`] before issuing a device
//! request. The webhook handler later calls [`Coordinator::signal_matching`]
//! with the key it parsed from the callback. The worker observes the result
//! through [`Coordinator::poll`] on its own tick.
//!
//! Only the first terminal signal after a reset is honored. Signals that
//! arrive while nothing is armed, or that name a different key, are logged
//! and dropped.

use rmc_common::MeasurementKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Remote batch operation run by the processing worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStage {
    CrossCorrAlign,
    VectorAverage,
}

impl ProcessStage {
    /// Name the device expects in `processName`
    pub fn process_name(&self) -> &'static str {
        match self {
            ProcessStage::CrossCorrAlign => "Cross corr align",
            ProcessStage::VectorAverage => "Vector average",
        }
    }
}

impl fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.process_name())
    }
}

/// What the armed operation is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinatorKey {
    Capture { key: MeasurementKey },
    Process { channel: String, stage: ProcessStage },
}

impl CoordinatorKey {
    pub fn capture(key: MeasurementKey) -> Self {
        CoordinatorKey::Capture { key }
    }

    pub fn process(channel: impl Into<String>, stage: ProcessStage) -> Self {
        CoordinatorKey::Process {
            channel: channel.into(),
            stage,
        }
    }
}

impl fmt::Display for CoordinatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorKey::Capture { key } => write!(f, "{}", key),
            CoordinatorKey::Process { channel, stage } => write!(f, "{} ({})", channel, stage),
        }
    }
}

/// Coordinator state
///
/// `Armed` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoordinatorStatus {
    Armed,
    Success,
    Error,
    Abort,
    Timeout,
}

impl CoordinatorStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CoordinatorStatus::Armed)
    }
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorStatus::Armed => "ARMED",
            CoordinatorStatus::Success => "SUCCESS",
            CoordinatorStatus::Error => "ERROR",
            CoordinatorStatus::Abort => "ABORT",
            CoordinatorStatus::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// What happened to an incoming signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDisposition {
    /// Recorded as the terminal result of the armed operation
    Accepted,
    /// Nothing was armed
    NotArmed,
    /// Armed for a different key
    KeyMismatch,
    /// The armed period already has a terminal result
    Duplicate,
}

/// Terminal result observed by a poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub status: CoordinatorStatus,
    pub message: Option<String>,
}

#[derive(Debug)]
struct Slot {
    key: Option<CoordinatorKey>,
    status: CoordinatorStatus,
    message: Option<String>,
    signaled: bool,
}

/// Event bridge between the webhook listener and one worker
#[derive(Debug)]
pub struct Coordinator {
    slot: Mutex<Slot>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                key: None,
                status: CoordinatorStatus::Armed,
                message: None,
                signaled: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm for a new operation
    ///
    /// Must be called before the triggering request is sent.
    pub fn reset(&self, key: CoordinatorKey) {
        let mut slot = self.lock();
        debug!(key = %key, "Coordinator armed");
        slot.key = Some(key);
        slot.status = CoordinatorStatus::Armed;
        slot.message = None;
        slot.signaled = false;
    }

    /// Drop the armed key so late callbacks are treated as unarmed
    pub fn disarm(&self) {
        let mut slot = self.lock();
        slot.key = None;
        slot.status = CoordinatorStatus::Armed;
        slot.message = None;
        slot.signaled = false;
    }

    /// Signal the armed operation without key correlation
    pub fn signal(&self, status: CoordinatorStatus, message: Option<String>) -> SignalDisposition {
        let mut slot = self.lock();
        Self::apply(&mut slot, status, message)
    }

    /// Signal only if `key` is the armed key
    pub fn signal_matching(
        &self,
        key: &CoordinatorKey,
        status: CoordinatorStatus,
        message: Option<String>,
    ) -> SignalDisposition {
        let mut slot = self.lock();
        match &slot.key {
            Some(armed) if armed != key => {
                warn!(
                    expected = %armed,
                    received = %key,
                    "Ignoring signal for a different operation"
                );
                SignalDisposition::KeyMismatch
            }
            _ => Self::apply(&mut slot, status, message),
        }
    }

    fn apply(
        slot: &mut Slot,
        status: CoordinatorStatus,
        message: Option<String>,
    ) -> SignalDisposition {
        let Some(key) = slot.key.as_ref() else {
            warn!(status = %status, "Signal received while nothing is armed; ignoring");
            return SignalDisposition::NotArmed;
        };
        if !status.is_terminal() {
            warn!(key = %key, "Ignoring non-terminal signal");
            return SignalDisposition::Duplicate;
        }
        if slot.signaled {
            debug!(key = %key, first = %slot.status, ignored = %status, "Duplicate signal ignored");
            return SignalDisposition::Duplicate;
        }
        debug!(key = %key, status = %status, "Coordinator signaled");
        slot.status = status;
        slot.message = message;
        slot.signaled = true;
        SignalDisposition::Accepted
    }

    /// Non-blocking check for a terminal result
    pub fn poll(&self) -> Option<Signal> {
        let slot = self.lock();
        if slot.signaled && slot.key.is_some() {
            Some(Signal {
                status: slot.status,
                message: slot.message.clone(),
            })
        } else {
            None
        }
    }

    /// Resolve the armed period as TIMEOUT
    ///
    /// A result that was already signaled stays in place and is returned.
    pub fn trigger_timeout(&self) -> Signal {
        let mut slot = self.lock();
        if !slot.signaled {
            slot.status = CoordinatorStatus::Timeout;
            slot.message = Some("Operation timed out".to_string());
            slot.signaled = true;
        }
        Signal {
            status: slot.status,
            message: slot.message.clone(),
        }
    }

    /// Currently armed key, if any
    pub fn armed_key(&self) -> Option<CoordinatorKey> {
        self.lock().key.clone()
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.lock().status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fl0() -> CoordinatorKey {
        CoordinatorKey::capture(MeasurementKey::new("FL", 0))
    }

    #[test]
    fn test_signal_before_reset_has_no_effect() {
        let coordinator = Coordinator::new();
        assert_eq!(
            coordinator.signal(CoordinatorStatus::Success, None),
            SignalDisposition::NotArmed
        );
        coordinator.reset(fl0());
        assert_eq!(coordinator.poll(), None);
    }

    #[test]
    fn test_first_signal_wins() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        assert_eq!(
            coordinator.signal(CoordinatorStatus::Error, Some("clipped".to_string())),
            SignalDisposition::Accepted
        );
        assert_eq!(
            coordinator.signal(CoordinatorStatus::Success, None),
            SignalDisposition::Duplicate
        );

        let signal = coordinator.poll().unwrap();
        assert_eq!(signal.status, CoordinatorStatus::Error);
        assert_eq!(signal.message.as_deref(), Some("clipped"));
    }

    #[test]
    fn test_poll_is_non_consuming() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        coordinator.signal(CoordinatorStatus::Success, None);
        assert!(coordinator.poll().is_some());
        assert!(coordinator.poll().is_some());
    }

    #[test]
    fn test_reset_clears_previous_result() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        coordinator.signal(CoordinatorStatus::Abort, None);
        coordinator.reset(fl0());
        assert_eq!(coordinator.poll(), None);
        assert_eq!(coordinator.status(), CoordinatorStatus::Armed);
    }

    #[test]
    fn test_mismatched_key_ignored() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        let other = CoordinatorKey::capture(MeasurementKey::new("FR", 0));
        assert_eq!(
            coordinator.signal_matching(&other, CoordinatorStatus::Success, None),
            SignalDisposition::KeyMismatch
        );
        assert_eq!(coordinator.poll(), None);
        assert_eq!(
            coordinator.signal_matching(&fl0(), CoordinatorStatus::Success, None),
            SignalDisposition::Accepted
        );
    }

    #[test]
    fn test_timeout_keeps_earlier_signal() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        coordinator.signal(CoordinatorStatus::Success, None);
        assert_eq!(coordinator.trigger_timeout().status, CoordinatorStatus::Success);
    }

    #[test]
    fn test_timeout_then_late_signal_is_duplicate() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        assert_eq!(coordinator.trigger_timeout().status, CoordinatorStatus::Timeout);
        assert_eq!(
            coordinator.signal(CoordinatorStatus::Success, None),
            SignalDisposition::Duplicate
        );
        assert_eq!(coordinator.poll().unwrap().status, CoordinatorStatus::Timeout);
    }

    #[test]
    fn test_disarm_rejects_late_callbacks() {
        let coordinator = Coordinator::new();
        coordinator.reset(fl0());
        coordinator.disarm();
        assert_eq!(
            coordinator.signal_matching(&fl0(), CoordinatorStatus::Success, None),
            SignalDisposition::NotArmed
        );
    }
}

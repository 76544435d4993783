//! Signal events and the notifier capability that publishes them

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::types::{ChannelId, SignalId, SignalStatus};

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Events published on lifecycle transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SignalEvent {
    #[serde(rename_all = "camelCase")]
    SignalEmitted {
        signal_id: SignalId,
        channel_id: ChannelId,
        pattern: Vec<f64>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    SignalResult {
        signal_id: SignalId,
        channel_id: ChannelId,
        attempt: u8,
        result: f64,
        status: SignalStatus,
        gale_used: bool,
    },
}

impl SignalEvent {
    pub fn signal_id(&self) -> SignalId {
        match self {
            SignalEvent::SignalEmitted { signal_id, .. }
            | SignalEvent::SignalResult { signal_id, .. } => *signal_id,
        }
    }
}

/// Fire-and-forget publisher. Failures are logged by the caller and never undo state.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: &SignalEvent) -> EngineResult<()>;
}

/// Fans events out to any number of in-process subscribers
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SignalEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: &SignalEvent) -> EngineResult<()> {
        // No subscribers is not a failure: nobody is listening yet
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: &SignalEvent) -> EngineResult<()> {
        match event {
            SignalEvent::SignalEmitted {
                signal_id,
                channel_id,
                pattern,
                ..
            } => info!(signal_id, channel = channel_id, pattern = ?pattern, "signalEmitted"),
            SignalEvent::SignalResult {
                signal_id,
                channel_id,
                attempt,
                result,
                status,
                gale_used,
            } => info!(
                signal_id,
                channel = channel_id,
                attempt,
                result,
                status = %status,
                gale_used,
                "signalResult"
            ),
        }
        Ok(())
    }
}

/// Keeps every published event in memory, in order
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SignalEvent>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SignalEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// When set, `publish` returns an error without recording
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, event: &SignalEvent) -> EngineResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::Notify("transport down".into()));
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

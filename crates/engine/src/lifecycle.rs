//! Signal lifecycle: emission and the two-round verification state machine
//!
//! Each channel has at most one open signal, tracked in an in-memory index
//! (`channel -> signal`). An open signal is verified by the next outcome of
//! its channel: a win closes it, a loss moves it to the gale, and the gale
//! outcome closes it either way.
//!
//! Calls for the same channel must not overlap; `SignalEngine` serializes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::notifier::{Notifier, SignalEvent};
use crate::store::SignalStore;
use crate::types::{sanitize_multiplier, ChannelId, Signal, SignalId, SignalStatus};

/// The verification step applied to an open signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub signal_id: SignalId,
    pub channel_id: ChannelId,
    /// 1 for the first attempt, 2 for the gale
    pub attempt: u8,
    pub result: f64,
    pub status: SignalStatus,
    pub gale_used: bool,
}

pub struct SignalLifecycle {
    store: Arc<dyn SignalStore>,
    notifier: Arc<dyn Notifier>,
    open: Mutex<HashMap<ChannelId, SignalId>>,
    win_threshold: f64,
}

impl SignalLifecycle {
    pub fn new(store: Arc<dyn SignalStore>, notifier: Arc<dyn Notifier>, win_threshold: f64) -> Self {
        Self {
            store,
            notifier,
            open: Mutex::new(HashMap::new()),
            win_threshold,
        }
    }

    fn index(&self) -> MutexGuard<'_, HashMap<ChannelId, SignalId>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_win(&self, multiplier: f64) -> bool {
        sanitize_multiplier(multiplier) > self.win_threshold
    }

    pub fn open_signal(&self, channel_id: ChannelId) -> Option<SignalId> {
        self.index().get(&channel_id).copied()
    }

    /// Snapshot of the open-signal index, ordered by channel
    pub fn open_signals(&self) -> Vec<(ChannelId, SignalId)> {
        let mut entries: Vec<_> = self.index().iter().map(|(c, s)| (*c, *s)).collect();
        entries.sort_unstable();
        entries
    }

    /// Rebuild the index from the store's open signals, e.g. after a restart.
    /// Existing entries win; otherwise the newest open signal per channel is tracked.
    pub async fn restore(&self) -> EngineResult<usize> {
        let open = self.store.list_open().await?;
        let mut index = self.index();
        let mut restored = 0;
        let mut stale = Vec::new();
        for signal in open {
            match index.entry(signal.channel_id) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(signal.id);
                    restored += 1;
                }
                std::collections::hash_map::Entry::Occupied(slot) if *slot.get() != signal.id => {
                    stale.push(signal.id);
                }
                std::collections::hash_map::Entry::Occupied(_) => {}
            }
        }
        if !stale.is_empty() {
            warn!(signal_ids = ?stale, "Older open signals left untracked, they will never be verified");
        }
        info!(restored, "Open signals restored from store");
        Ok(restored)
    }

    /// Remove the index entry only if it still points at `signal_id`
    fn release(&self, channel_id: ChannelId, signal_id: SignalId) {
        let mut index = self.index();
        if index.get(&channel_id) == Some(&signal_id) {
            index.remove(&channel_id);
        }
    }

    fn publish(&self, event: SignalEvent) {
        if let Err(e) = self.notifier.publish(&event) {
            warn!(signal_id = event.signal_id(), error = %e, "Failed to publish signal event");
        }
    }

    // ------------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------------

    /// Open a new signal for `channel_id` unless one is already open
    pub async fn try_emit(&self, channel_id: ChannelId, pattern: &[f64]) -> Option<Signal> {
        if let Some(existing) = self.open_signal(channel_id) {
            info!(
                channel = channel_id,
                signal_id = existing,
                "Signal already pending, emission suppressed"
            );
            return None;
        }

        let signal = match self.store.create(channel_id, pattern).await {
            Ok(signal) => signal,
            Err(e) => {
                // Nothing was registered, the next match may emit again
                error!(channel = channel_id, error = %e, "Failed to create signal");
                return None;
            }
        };

        self.index().insert(channel_id, signal.id);
        info!(
            channel = channel_id,
            signal_id = signal.id,
            pattern = ?pattern,
            "Signal emitted"
        );

        self.publish(SignalEvent::SignalEmitted {
            signal_id: signal.id,
            channel_id,
            pattern: signal.pattern.clone(),
            timestamp: signal.created_at,
        });

        Some(signal)
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Apply one outcome to the channel's open signal, if there is one.
    ///
    /// When verification fails the entry is dropped anyway. The stored row then
    /// stays open with no tracker, and a later emission on the channel leaves
    /// two open rows; `restore` tracks only the newest.
    pub async fn on_outcome(
        &self,
        channel_id: ChannelId,
        round_id: &str,
        multiplier: f64,
    ) -> Option<Verification> {
        let signal_id = self.open_signal(channel_id)?;

        match self.verify(channel_id, signal_id, round_id, multiplier).await {
            Ok(verification) => Some(verification),
            Err(EngineError::Integrity(id)) => {
                warn!(channel = channel_id, signal_id = id, "Pending signal not found or already closed");
                self.release(channel_id, id);
                None
            }
            Err(e) => {
                // Clearing trades a possibly missed verification for a channel that can emit again
                error!(channel = channel_id, signal_id, error = %e, "Failed to verify signal");
                self.release(channel_id, signal_id);
                None
            }
        }
    }

    async fn verify(
        &self,
        channel_id: ChannelId,
        signal_id: SignalId,
        round_id: &str,
        multiplier: f64,
    ) -> EngineResult<Verification> {
        let multiplier = sanitize_multiplier(multiplier);
        let won = self.is_win(multiplier);

        let signal = self
            .store
            .fetch_open(channel_id)
            .await?
            .filter(|s| s.id == signal_id)
            .ok_or(EngineError::Integrity(signal_id))?;

        let verification = if signal.first_attempt_result.is_none() {
            let status = if won {
                SignalStatus::Won
            } else {
                SignalStatus::PendingGale
            };
            self.store
                .record_first_attempt(signal_id, multiplier, round_id, status)
                .await?;

            if won {
                self.release(channel_id, signal_id);
                info!(channel = channel_id, signal_id, multiplier, round = round_id, "Signal won on first attempt");
            } else {
                info!(channel = channel_id, signal_id, multiplier, round = round_id, "First attempt lost, waiting for gale");
            }

            Verification {
                signal_id,
                channel_id,
                attempt: 1,
                result: multiplier,
                status,
                gale_used: false,
            }
        } else {
            let status = if won {
                SignalStatus::Won
            } else {
                SignalStatus::Lost
            };
            self.store
                .record_second_attempt(signal_id, multiplier, round_id, status)
                .await?;

            // The gale is the last attempt
            self.release(channel_id, signal_id);
            info!(channel = channel_id, signal_id, multiplier, round = round_id, status = %status, "Signal closed on gale");

            Verification {
                signal_id,
                channel_id,
                attempt: 2,
                result: multiplier,
                status,
                gale_used: true,
            }
        };

        self.publish(SignalEvent::SignalResult {
            signal_id,
            channel_id,
            attempt: verification.attempt,
            result: verification.result,
            status: verification.status,
            gale_used: verification.gale_used,
        });

        Ok(verification)
    }
}

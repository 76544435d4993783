//! Engine facade: one call per new round result
//!
//! Order of work for an outcome: dedup, verification of the channel's open
//! signal, history fetch, pattern detection, emission. Same-channel calls are
//! serialized by a per-channel async lock held for the whole invocation;
//! channels never wait on each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use crate::dedup::OutcomeDeduplicator;
use crate::error::EngineResult;
use crate::lifecycle::{SignalLifecycle, Verification};
use crate::notifier::Notifier;
use crate::patterns::{Detection, PatternMatcher};
use crate::store::{HistoryStore, SignalStore};
use crate::types::{sanitize_multiplier, ChannelId, EngineConfig, Outcome, Signal, SignalId};

/// What one `process_new_result` call did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessReport {
    /// The exact result was already processed
    Duplicate,
    Processed {
        verification: Option<Verification>,
        /// Absent when history was unavailable or too short
        detection: Option<Detection>,
        emitted: Option<Signal>,
    },
}

impl ProcessReport {
    pub fn emitted(&self) -> Option<&Signal> {
        match self {
            ProcessReport::Processed { emitted, .. } => emitted.as_ref(),
            ProcessReport::Duplicate => None,
        }
    }

    pub fn verification(&self) -> Option<&Verification> {
        match self {
            ProcessReport::Processed { verification, .. } => verification.as_ref(),
            ProcessReport::Duplicate => None,
        }
    }
}

pub struct SignalEngine {
    config: EngineConfig,
    history: Arc<dyn HistoryStore>,
    matcher: PatternMatcher,
    lifecycle: SignalLifecycle,
    dedup: Mutex<OutcomeDeduplicator>,
    channel_locks: Mutex<HashMap<ChannelId, Arc<AsyncMutex<()>>>>,
}

impl SignalEngine {
    pub fn new(
        config: EngineConfig,
        history: Arc<dyn HistoryStore>,
        signals: Arc<dyn SignalStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let lifecycle = SignalLifecycle::new(signals, notifier, config.win_threshold);
        let dedup = OutcomeDeduplicator::new(config.dedup_capacity, config.dedup_retain);
        Self {
            config,
            history,
            matcher: PatternMatcher::default(),
            lifecycle,
            dedup: Mutex::new(dedup),
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the default rule table
    pub fn with_matcher(mut self, matcher: PatternMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    pub fn open_signals(&self) -> Vec<(ChannelId, SignalId)> {
        self.lifecycle.open_signals()
    }

    /// Re-track signals left open by a previous run
    pub async fn restore(&self) -> EngineResult<usize> {
        self.lifecycle.restore().await
    }

    fn channel_lock(&self, channel_id: ChannelId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.channel_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(channel_id).or_default().clone()
    }

    /// Feed one round result through the engine. Failures are logged and contained.
    pub async fn process_new_result(
        &self,
        channel_id: ChannelId,
        round_id: &str,
        multiplier: f64,
    ) -> ProcessReport {
        let multiplier = sanitize_multiplier(multiplier);

        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let accepted = self
            .dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .accept(channel_id, round_id, multiplier);
        if !accepted {
            debug!(channel = channel_id, round = round_id, multiplier, "Result already processed, skipping");
            return ProcessReport::Duplicate;
        }

        let verification = self
            .lifecycle
            .on_outcome(channel_id, round_id, multiplier)
            .await;

        let history = match self
            .history
            .fetch_recent(channel_id, self.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                error!(channel = channel_id, error = %e, "Failed to fetch recent results");
                return ProcessReport::Processed {
                    verification,
                    detection: None,
                    emitted: None,
                };
            }
        };

        let values = unique_multipliers(&history);
        if values.len() < self.matcher.min_history() {
            debug!(channel = channel_id, available = values.len(), "Not enough history for detection");
            return ProcessReport::Processed {
                verification,
                detection: None,
                emitted: None,
            };
        }

        let detection = self.matcher.detect(&values, &self.config);
        let emitted = match &detection.matched {
            Some(m) => {
                info!(channel = channel_id, pattern = %m.name, "Pattern matched");
                self.lifecycle.try_emit(channel_id, &m.values).await
            }
            None => None,
        };

        ProcessReport::Processed {
            verification,
            detection: Some(detection),
            emitted,
        }
    }
}

/// Newest-first multipliers with repeated round ids dropped (first occurrence kept)
pub fn unique_multipliers(history: &[Outcome]) -> Vec<f64> {
    let mut seen = HashSet::new();
    history
        .iter()
        .filter(|o| seen.insert(o.round_id.as_str()))
        .map(|o| sanitize_multiplier(o.multiplier))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{RecordingNotifier, SignalEvent};
    use crate::store::MemoryStore;
    use crate::types::SignalStatus;

    struct Harness {
        engine: SignalEngine,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        next_round: u32,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let notifier = Arc::new(RecordingNotifier::new());
            let engine = SignalEngine::new(
                EngineConfig::default(),
                store.clone(),
                store.clone(),
                notifier.clone(),
            );
            Self {
                engine,
                store,
                notifier,
                next_round: 0,
            }
        }

        /// Record a round for channel 1 the way the host does, then process it
        async fn feed(&mut self, multiplier: f64) -> ProcessReport {
            self.next_round += 1;
            let round = format!("r{}", self.next_round);
            self.store.record_round(1, &round, multiplier);
            self.engine.process_new_result(1, &round, multiplier).await
        }
    }

    #[test]
    fn test_unique_multipliers_keeps_first_occurrence() {
        let outcome = |round: &str, m: f64| Outcome {
            channel_id: 1,
            round_id: round.to_string(),
            multiplier: m,
            timestamp: 0,
        };
        let history = vec![
            outcome("c", 1.6),
            outcome("c", 1.6),
            outcome("b", f64::NAN),
            outcome("a", 2.4),
        ];
        assert_eq!(unique_multipliers(&history), vec![1.6, 0.0, 2.4]);
    }

    #[tokio::test]
    async fn test_emits_on_three_signal_pattern() {
        let mut h = Harness::new();
        // Oldest first: 1.9, 1.7, 1.6 makes newest-first 1.6, 1.7, 1.9
        assert!(h.feed(1.9).await.emitted().is_none());
        assert!(h.feed(1.7).await.emitted().is_none());
        let report = h.feed(1.6).await;

        let signal = report.emitted().unwrap();
        assert_eq!(signal.pattern, vec![1.6, 1.7, 1.9]);
        match &report {
            ProcessReport::Processed { detection: Some(d), .. } => {
                assert_eq!(d.matched.as_ref().unwrap().name, "patron_3_signals");
                assert_eq!(d.trend.levels, vec![-3, -2, -1]);
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert_eq!(h.engine.open_signals(), vec![(1, signal.id)]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_processed_once() {
        let mut h = Harness::new();
        h.feed(1.9).await;
        h.feed(1.7).await;
        h.store.record_round(1, "dup", 1.6);

        let first = h.engine.process_new_result(1, "dup", 1.6).await;
        let second = h.engine.process_new_result(1, "dup", 1.6).await;

        assert!(first.emitted().is_some());
        assert_eq!(second, ProcessReport::Duplicate);
        assert_eq!(h.store.signals().len(), 1);
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_gale_scenario_end_to_end() {
        let mut h = Harness::new();
        h.feed(1.9).await;
        h.feed(1.7).await;
        let signal_id = h.feed(1.6).await.emitted().unwrap().id;

        let report = h.feed(1.2).await;
        let v = report.verification().unwrap();
        assert_eq!(v.status, SignalStatus::PendingGale);
        // Still open, so the shape matched on this history cannot emit
        assert!(report.emitted().is_none());

        let report = h.feed(1.8).await;
        let v = report.verification().unwrap();
        assert_eq!((v.attempt, v.status, v.gale_used), (2, SignalStatus::Won, true));
        assert_eq!(h.store.signal(signal_id).unwrap().status, SignalStatus::Won);

        let results: Vec<_> = h
            .notifier
            .events()
            .into_iter()
            .filter(|e| matches!(e, SignalEvent::SignalResult { .. }))
            .collect();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_new_signal_can_follow_a_close_on_same_outcome() {
        let mut h = Harness::new();
        h.feed(1.9).await;
        h.feed(1.7).await;
        let first = h.feed(1.6).await.emitted().unwrap().id;

        // 1.7 wins the first signal; history is now 1.7, 1.6, 1.7 which matches again
        let report = h.feed(1.7).await;
        assert_eq!(report.verification().unwrap().status, SignalStatus::Won);
        let second = report.emitted().unwrap().id;
        assert_ne!(first, second);
        assert_eq!(h.engine.open_signals(), vec![(1, second)]);
    }

    #[tokio::test]
    async fn test_short_history_skips_detection() {
        let mut h = Harness::new();
        let report = h.feed(1.6).await;
        assert_eq!(
            report,
            ProcessReport::Processed {
                verification: None,
                detection: None,
                emitted: None,
            }
        );
    }

    #[tokio::test]
    async fn test_history_failure_still_verifies() {
        let mut h = Harness::new();
        h.feed(1.9).await;
        h.feed(1.7).await;
        h.feed(1.6).await.emitted().unwrap();

        h.store.set_fail_history(true);
        let report = h.feed(3.0).await;
        assert_eq!(report.verification().unwrap().status, SignalStatus::Won);
        assert!(matches!(report, ProcessReport::Processed { detection: None, .. }));
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let h = Harness::new();
        for (round, m) in [("a1", 1.9), ("a2", 1.7), ("a3", 1.6)] {
            h.store.record_round(1, round, m);
            h.engine.process_new_result(1, round, m).await;
        }
        for (round, m) in [("b1", 1.9), ("b2", 1.7), ("b3", 1.6)] {
            h.store.record_round(2, round, m);
            h.engine.process_new_result(2, round, m).await;
        }
        let open = h.engine.open_signals();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].0, 1);
        assert_eq!(open[1].0, 2);
    }

    /// Parks channel 1 inside `fetch_recent` until released
    struct GatedHistory {
        inner: Arc<MemoryStore>,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl HistoryStore for GatedHistory {
        async fn fetch_recent(&self, channel_id: ChannelId, limit: usize) -> EngineResult<Vec<Outcome>> {
            if channel_id == 1 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.fetch_recent(channel_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_blocked_channel_does_not_stall_others() {
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(GatedHistory {
            inner: store.clone(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let engine = Arc::new(SignalEngine::new(
            EngineConfig::default(),
            history.clone(),
            store.clone(),
            Arc::new(RecordingNotifier::new()),
        ));

        store.record_round(1, "a1", 1.6);
        let blocked = tokio::spawn({
            let engine = engine.clone();
            async move { engine.process_new_result(1, "a1", 1.6).await }
        });
        history.entered.notified().await;

        let mut last = None;
        for (round, m) in [("b1", 1.9), ("b2", 1.7), ("b3", 1.6)] {
            store.record_round(2, round, m);
            let report = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                engine.process_new_result(2, round, m),
            )
            .await
            .expect("channel 2 waited on channel 1");
            last = Some(report);
        }
        assert!(last.unwrap().emitted().is_some());
        assert!(!blocked.is_finished());

        history.release.notify_one();
        let report = blocked.await.unwrap();
        assert!(matches!(report, ProcessReport::Processed { detection: None, .. }));
        assert_eq!(engine.open_signals().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_channel_calls_serialize() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(SignalEngine::new(
            EngineConfig::default(),
            store.clone(),
            store.clone(),
            Arc::new(RecordingNotifier::new()),
        ));
        for (round, m) in [("r1", 1.9), ("r2", 1.7), ("r3", 1.6)] {
            store.record_round(1, round, m);
        }

        // The same matching history processed from many tasks at once
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.process_new_result(1, &format!("late{i}"), 1.6).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let open: Vec<_> = store
            .signals()
            .into_iter()
            .filter(|s| s.status.is_open())
            .collect();
        assert_eq!(open.len(), 1);
    }
}

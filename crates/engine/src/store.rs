//! Storage collaborators: round history and signal persistence
//!
//! The engine only sees the two traits below. `SqliteStore` adapts the
//! `persistence` repositories; `MemoryStore` keeps everything in process for
//! tests and offline replays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use persistence::repository::{GameRoundRecord, RoundRepository, SignalRecord, SignalRepository};
use persistence::SqlitePool;

use crate::error::{EngineError, EngineResult};
use crate::types::{now_millis, ChannelId, Outcome, Signal, SignalId, SignalStatus};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Up to `limit` outcomes for `channel_id`, newest first
    async fn fetch_recent(&self, channel_id: ChannelId, limit: usize) -> EngineResult<Vec<Outcome>>;
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Persist a new signal in `pending_first`
    async fn create(&self, channel_id: ChannelId, pattern: &[f64]) -> EngineResult<Signal>;

    async fn record_first_attempt(
        &self,
        signal_id: SignalId,
        multiplier: f64,
        round_id: &str,
        status: SignalStatus,
    ) -> EngineResult<()>;

    async fn record_second_attempt(
        &self,
        signal_id: SignalId,
        multiplier: f64,
        round_id: &str,
        status: SignalStatus,
    ) -> EngineResult<()>;

    /// The newest open signal for a channel, if any
    async fn fetch_open(&self, channel_id: ChannelId) -> EngineResult<Option<Signal>>;

    /// Every open signal, newest first
    async fn list_open(&self) -> EngineResult<Vec<Signal>>;
}

// ============================================================================
// SQLite
// ============================================================================

/// Store backed by the `persistence` crate
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn signal_from_record(record: SignalRecord) -> EngineResult<Signal> {
    let status = SignalStatus::parse(&record.status).ok_or_else(|| {
        EngineError::Store(format!(
            "signal {} has unknown status '{}'",
            record.id, record.status
        ))
    })?;
    let pattern = record.pattern()?;

    Ok(Signal {
        id: record.id,
        channel_id: record.channel_id,
        pattern,
        created_at: record.created_at,
        first_attempt_result: record.first_attempt_result,
        first_attempt_round_id: record.first_attempt_round_id,
        second_attempt_result: record.second_attempt_result,
        second_attempt_round_id: record.second_attempt_round_id,
        status,
    })
}

fn outcome_from_record(record: GameRoundRecord) -> Outcome {
    Outcome {
        channel_id: record.channel_id,
        round_id: record.round_id,
        multiplier: record.max_multiplier,
        timestamp: record.timestamp,
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn fetch_recent(&self, channel_id: ChannelId, limit: usize) -> EngineResult<Vec<Outcome>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rounds = RoundRepository::new(&self.pool)
            .get_last_results(channel_id, limit)
            .await?;
        Ok(rounds.into_iter().map(outcome_from_record).collect())
    }
}

#[async_trait]
impl SignalStore for SqliteStore {
    async fn create(&self, channel_id: ChannelId, pattern: &[f64]) -> EngineResult<Signal> {
        let record = SignalRepository::new(&self.pool)
            .create(channel_id, pattern, now_millis())
            .await?;
        signal_from_record(record)
    }

    async fn record_first_attempt(
        &self,
        signal_id: SignalId,
        multiplier: f64,
        round_id: &str,
        status: SignalStatus,
    ) -> EngineResult<()> {
        SignalRepository::new(&self.pool)
            .update_first_attempt(signal_id, multiplier, round_id, status.as_str(), now_millis())
            .await?;
        Ok(())
    }

    async fn record_second_attempt(
        &self,
        signal_id: SignalId,
        multiplier: f64,
        round_id: &str,
        status: SignalStatus,
    ) -> EngineResult<()> {
        SignalRepository::new(&self.pool)
            .update_second_attempt(signal_id, multiplier, round_id, status.as_str(), now_millis())
            .await?;
        Ok(())
    }

    async fn fetch_open(&self, channel_id: ChannelId) -> EngineResult<Option<Signal>> {
        let pending = SignalRepository::new(&self.pool).get_pending(channel_id).await?;
        pending.into_iter().next().map(signal_from_record).transpose()
    }

    async fn list_open(&self) -> EngineResult<Vec<Signal>> {
        SignalRepository::new(&self.pool)
            .get_all_pending()
            .await?
            .into_iter()
            .map(signal_from_record)
            .collect()
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryState {
    /// Per channel, oldest first
    rounds: HashMap<ChannelId, Vec<Outcome>>,
    signals: Vec<Signal>,
    next_id: SignalId,
}

/// Process-local store. Failure switches let tests exercise the error paths.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_history: AtomicBool,
    fail_signal_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writes(&self) -> EngineResult<()> {
        if self.fail_signal_writes.load(Ordering::Relaxed) {
            return Err(EngineError::Store("signal store unavailable".into()));
        }
        Ok(())
    }

    pub fn push_outcome(&self, outcome: Outcome) {
        self.state()
            .rounds
            .entry(outcome.channel_id)
            .or_default()
            .push(outcome);
    }

    /// Append a round for `channel_id` stamped with the current time
    pub fn record_round(&self, channel_id: ChannelId, round_id: &str, multiplier: f64) {
        self.push_outcome(Outcome {
            channel_id,
            round_id: round_id.to_string(),
            multiplier,
            timestamp: now_millis(),
        });
    }

    pub fn signal(&self, id: SignalId) -> Option<Signal> {
        self.state().signals.iter().find(|s| s.id == id).cloned()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.state().signals.clone()
    }

    /// Drop a signal entirely, as if another process deleted the row
    pub fn remove_signal(&self, id: SignalId) {
        self.state().signals.retain(|s| s.id != id);
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_signal_writes(&self, fail: bool) {
        self.fail_signal_writes.store(fail, Ordering::Relaxed);
    }

    fn update_signal(
        &self,
        signal_id: SignalId,
        apply: impl FnOnce(&mut Signal),
    ) -> EngineResult<()> {
        self.check_writes()?;
        let mut state = self.state();
        let signal = state
            .signals
            .iter_mut()
            .find(|s| s.id == signal_id)
            .ok_or_else(|| EngineError::Store(format!("signal {signal_id} not found")))?;
        apply(signal);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn fetch_recent(&self, channel_id: ChannelId, limit: usize) -> EngineResult<Vec<Outcome>> {
        if self.fail_history.load(Ordering::Relaxed) {
            return Err(EngineError::Store("history store unavailable".into()));
        }
        let state = self.state();
        let recent = state
            .rounds
            .get(&channel_id)
            .map(|rounds| rounds.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(recent)
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn create(&self, channel_id: ChannelId, pattern: &[f64]) -> EngineResult<Signal> {
        self.check_writes()?;
        let mut state = self.state();
        state.next_id += 1;
        let signal = Signal {
            id: state.next_id,
            channel_id,
            pattern: pattern.to_vec(),
            created_at: now_millis(),
            first_attempt_result: None,
            first_attempt_round_id: None,
            second_attempt_result: None,
            second_attempt_round_id: None,
            status: SignalStatus::PendingFirst,
        };
        state.signals.push(signal.clone());
        Ok(signal)
    }

    async fn record_first_attempt(
        &self,
        signal_id: SignalId,
        multiplier: f64,
        round_id: &str,
        status: SignalStatus,
    ) -> EngineResult<()> {
        self.update_signal(signal_id, |s| {
            s.first_attempt_result = Some(multiplier);
            s.first_attempt_round_id = Some(round_id.to_string());
            s.status = status;
        })
    }

    async fn record_second_attempt(
        &self,
        signal_id: SignalId,
        multiplier: f64,
        round_id: &str,
        status: SignalStatus,
    ) -> EngineResult<()> {
        self.update_signal(signal_id, |s| {
            s.second_attempt_result = Some(multiplier);
            s.second_attempt_round_id = Some(round_id.to_string());
            s.status = status;
        })
    }

    async fn fetch_open(&self, channel_id: ChannelId) -> EngineResult<Option<Signal>> {
        let state = self.state();
        Ok(state
            .signals
            .iter()
            .rev()
            .find(|s| s.channel_id == channel_id && s.status.is_open())
            .cloned())
    }

    async fn list_open(&self) -> EngineResult<Vec<Signal>> {
        let state = self.state();
        Ok(state
            .signals
            .iter()
            .rev()
            .filter(|s| s.status.is_open())
            .cloned()
            .collect())
    }
}

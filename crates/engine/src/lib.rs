//! Round signal engine: pattern detection and signal lifecycle
//!
//! Provides:
//! - Outcome deduplication for repeated feed deliveries
//! - Trend levels with support/resistance annotation
//! - A declarative, priority-ordered pattern rule table
//! - Per-channel signal lifecycle (first attempt + one gale)
//! - `SignalEngine`, the single entry point per new round result
//! - Storage and notifier collaborators (SQLite, in-memory, broadcast)

pub mod dedup;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notifier;
pub mod patterns;
pub mod store;
pub mod trend;
pub mod types;

// Re-exports for convenience
pub use dedup::OutcomeDeduplicator;
pub use engine::{unique_multipliers, ProcessReport, SignalEngine};
pub use error::{EngineError, EngineResult};
pub use lifecycle::{SignalLifecycle, Verification};
pub use notifier::{BroadcastNotifier, LogNotifier, Notifier, RecordingNotifier, SignalEvent};
pub use patterns::{default_rules, Bound, Detection, PatternMatch, PatternMatcher, PatternRule};
pub use store::{HistoryStore, MemoryStore, SignalStore, SqliteStore};
pub use trend::{analyze_trend, trend_levels, TrendAnalysis};
pub use types::*;

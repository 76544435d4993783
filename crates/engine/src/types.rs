//! Types shared across the signal engine

use serde::{Deserialize, Serialize};

/// Identifier of an independent outcome stream (a bookmaker)
pub type ChannelId = i64;

/// Identifier assigned to a signal by the signal store
pub type SignalId = i64;

/// One observed round result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub channel_id: ChannelId,
    pub round_id: String,
    pub multiplier: f64,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Lifecycle state of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    PendingFirst,
    PendingGale,
    Won,
    Lost,
}

impl SignalStatus {
    pub fn is_open(self) -> bool {
        matches!(self, SignalStatus::PendingFirst | SignalStatus::PendingGale)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::PendingFirst => "pending_first",
            SignalStatus::PendingGale => "pending_gale",
            SignalStatus::Won => "won",
            SignalStatus::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_first" => Some(SignalStatus::PendingFirst),
            "pending_gale" => Some(SignalStatus::PendingGale),
            "won" => Some(SignalStatus::Won),
            "lost" => Some(SignalStatus::Lost),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An emitted advisory, tracked through first attempt and gale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub channel_id: ChannelId,
    /// Multipliers (newest first) that triggered the emission
    pub pattern: Vec<f64>,
    /// Unix milliseconds
    pub created_at: i64,
    pub first_attempt_result: Option<f64>,
    pub first_attempt_round_id: Option<String>,
    pub second_attempt_result: Option<f64>,
    pub second_attempt_round_id: Option<String>,
    pub status: SignalStatus,
}

/// Tunables for the engine. Defaults are the production constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rounds fetched from history per invocation
    pub history_limit: usize,
    /// Rounds fed to the trend transformer
    pub trend_window: usize,
    /// Values at or above this raise the trend level
    pub trend_threshold: f64,
    /// A verification round wins when its multiplier is strictly above this
    pub win_threshold: f64,
    /// The dedup set is pruned once it grows past this many keys
    pub dedup_capacity: usize,
    /// Keys kept after pruning
    pub dedup_retain: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 70,
            trend_window: 20,
            trend_threshold: 2.0,
            win_threshold: 1.50,
            dedup_capacity: 1000,
            dedup_retain: 500,
        }
    }
}

/// Replace values that cannot be a real multiplier with `0.0`.
///
/// `0.0` fails every "above" comparison, so a malformed record counts as a loss
/// instead of halting the stream.
pub fn sanitize_multiplier(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Parse a multiplier from feed text, falling back to the `0.0` sentinel
pub fn parse_multiplier(raw: &str) -> f64 {
    raw.trim()
        .trim_end_matches(['x', 'X'])
        .parse::<f64>()
        .map(sanitize_multiplier)
        .unwrap_or(0.0)
}

/// Current time in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            SignalStatus::PendingFirst,
            SignalStatus::PendingGale,
            SignalStatus::Won,
            SignalStatus::Lost,
        ] {
            assert_eq!(SignalStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SignalStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SignalStatus::PendingGale).unwrap();
        assert_eq!(json, "\"pending_gale\"");
    }

    #[test]
    fn test_open_and_terminal() {
        assert!(SignalStatus::PendingFirst.is_open());
        assert!(SignalStatus::PendingGale.is_open());
        assert!(SignalStatus::Won.is_terminal());
        assert!(SignalStatus::Lost.is_terminal());
    }

    #[test]
    fn test_malformed_multipliers_become_sentinel() {
        assert_eq!(sanitize_multiplier(f64::NAN), 0.0);
        assert_eq!(sanitize_multiplier(f64::INFINITY), 0.0);
        assert_eq!(sanitize_multiplier(-3.0), 0.0);
        assert_eq!(sanitize_multiplier(1.75), 1.75);

        assert_eq!(parse_multiplier("2.35"), 2.35);
        assert_eq!(parse_multiplier(" 1.10x "), 1.10);
        assert_eq!(parse_multiplier("abc"), 0.0);
        assert_eq!(parse_multiplier(""), 0.0);
    }

    #[test]
    fn test_config_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.history_limit, 70);
        assert_eq!(cfg.trend_window, 20);
        assert_eq!(cfg.trend_threshold, 2.0);
        assert_eq!(cfg.win_threshold, 1.50);
        assert_eq!(cfg.dedup_capacity, 1000);
        assert_eq!(cfg.dedup_retain, 500);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"win_threshold": 1.3}"#).unwrap();
        assert_eq!(cfg.win_threshold, 1.3);
        assert_eq!(cfg.history_limit, 70);
    }
}

//! Pattern matching over the most recent multipliers
//!
//! A rule is a positional list of strict bounds: `conditions[i]` tests the
//! i-th most recent value. Rules are evaluated in table order and the first
//! satisfied rule wins, so adding a shape never touches the control flow.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::trend::{analyze_trend, TrendAnalysis};
use crate::types::EngineConfig;

// ============================================================================
// Rules
// ============================================================================

/// Strict comparison against a single value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bound {
    Above(f64),
    Below(f64),
}

impl Bound {
    pub fn holds(self, value: f64) -> bool {
        match self {
            Bound::Above(limit) => value > limit,
            Bound::Below(limit) => value < limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub name: String,
    pub conditions: Vec<Bound>,
}

impl PatternRule {
    pub fn new(name: impl Into<String>, conditions: Vec<Bound>) -> Self {
        Self {
            name: name.into(),
            conditions,
        }
    }

    pub fn required_len(&self) -> usize {
        self.conditions.len()
    }

    /// `values` newest first; shorter histories never match
    pub fn matches(&self, values: &[f64]) -> bool {
        values.len() >= self.required_len()
            && self
                .conditions
                .iter()
                .zip(values)
                .all(|(bound, &value)| bound.holds(value))
    }
}

/// The production rule table, in priority order
pub fn default_rules() -> Vec<PatternRule> {
    use Bound::{Above, Below};

    vec![
        PatternRule::new("patron_3_signals", vec![Above(1.50), Above(1.50), Below(2.00)]),
        PatternRule::new(
            "patron_3_signals_second",
            vec![Below(2.00), Above(1.50), Above(1.50)],
        ),
        PatternRule::new(
            "patron_6_signals",
            vec![
                Below(2.00),
                Below(2.00),
                Below(2.00),
                Above(2.00),
                Above(2.00),
                Above(2.00),
            ],
        ),
        PatternRule::new(
            "patron_6_signals_second",
            vec![
                Above(2.00),
                Above(2.00),
                Above(2.00),
                Below(2.00),
                Below(2.00),
                Below(2.00),
            ],
        ),
    ]
}

// ============================================================================
// Matcher
// ============================================================================

/// The rule that fired and the values it fired on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub name: String,
    /// The first `required_len` values, newest first
    pub values: Vec<f64>,
}

/// Result of one detection pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub matched: Option<PatternMatch>,
    /// The capped history the pass ran on, newest first
    pub values: Vec<f64>,
    /// Annotation only, never consulted for the match
    pub trend: TrendAnalysis,
}

impl Detection {
    pub fn is_detected(&self) -> bool {
        self.matched.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PatternMatcher {
    rules: Vec<PatternRule>,
    min_history: usize,
}

impl PatternMatcher {
    /// Build a matcher over `rules`, rejecting empty or duplicate-named rules
    pub fn new(rules: Vec<PatternRule>) -> EngineResult<Self> {
        let mut names = HashSet::new();
        for rule in &rules {
            if rule.conditions.is_empty() {
                return Err(EngineError::InvalidRule(format!(
                    "rule '{}' has no conditions",
                    rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(EngineError::InvalidRule(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }

        let min_history = rules
            .iter()
            .map(PatternRule::required_len)
            .min()
            .unwrap_or(usize::MAX);

        Ok(Self { rules, min_history })
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Fewest values any rule can match on
    pub fn min_history(&self) -> usize {
        self.min_history
    }

    /// Run the trend annotation and the rule table over a newest-first history
    pub fn detect(&self, values: &[f64], config: &EngineConfig) -> Detection {
        let values = &values[..values.len().min(config.history_limit)];
        if values.len() < self.min_history {
            return Detection {
                matched: None,
                values: values.to_vec(),
                trend: TrendAnalysis::default(),
            };
        }

        let trend = analyze_trend(values, config.trend_window, config.trend_threshold);
        debug!(
            levels = ?trend.levels,
            support = trend.support,
            resistance = trend.resistance,
            same_level = trend.same_level_count,
            support_hits = trend.support_hits,
            resistance_hits = trend.resistance_hits,
            "Trend levels"
        );

        let matched = self
            .rules
            .iter()
            .find(|rule| rule.matches(values))
            .map(|rule| PatternMatch {
                name: rule.name.clone(),
                values: values[..rule.required_len()].to_vec(),
            });

        if let Some(m) = &matched {
            debug!(pattern = %m.name, values = ?m.values, "Pattern detected");
        }

        Detection {
            matched,
            values: values.to_vec(),
            trend,
        }
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        let rules = default_rules();
        let min_history = rules.iter().map(PatternRule::required_len).min().unwrap_or(0);
        Self { rules, min_history }
    }
}

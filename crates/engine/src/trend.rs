//! Trend levels and support/resistance annotation
//!
//! The window is scanned from its oldest value to its newest, moving a running
//! counter up for every value at or above the threshold and down otherwise.
//! Levels are reported aligned with the input, newest first.

use serde::{Deserialize, Serialize};

/// Below this window size no support/resistance annotation is computed
const MIN_LEVELS_FOR_ZONES: usize = 5;
const MIN_SAME_LEVEL: usize = 3;
const MIN_ZONE_HITS: usize = 2;

/// Trend levels for the analysis window plus the zone annotation for its newest value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    /// One level per window value, newest first
    pub levels: Vec<i32>,
    /// Newest value sits on a level that repeatedly bounced up
    pub support: bool,
    /// Newest value sits on a level that repeatedly bounced down
    pub resistance: bool,
    /// Indices (newest included) sharing the newest value's level
    pub same_level_count: usize,
    pub support_hits: usize,
    pub resistance_hits: usize,
}

/// Cumulative +1/-1 levels, computed oldest to newest and returned newest first
pub fn trend_levels(values: &[f64], threshold: f64) -> Vec<i32> {
    let mut levels = vec![0; values.len()];
    let mut count = 0i32;
    for (i, &value) in values.iter().enumerate().rev() {
        if value >= threshold {
            count += 1;
        } else {
            count -= 1;
        }
        levels[i] = count;
    }
    levels
}

/// Analyze the first `window` values of a newest-first history
pub fn analyze_trend(values: &[f64], window: usize, threshold: f64) -> TrendAnalysis {
    let window = &values[..values.len().min(window)];
    let levels = trend_levels(window, threshold);

    let mut analysis = TrendAnalysis {
        levels,
        ..Default::default()
    };

    if analysis.levels.len() < MIN_LEVELS_FOR_ZONES {
        return analysis;
    }

    let levels = &analysis.levels;
    let current = levels[0];
    let last = levels.len() - 1;

    let mut same_level_count = 0;
    let mut support_hits = 0;
    let mut resistance_hits = 0;

    for (i, &level) in levels.iter().enumerate() {
        if level != current {
            continue;
        }
        same_level_count += 1;

        // The newest value is the one being annotated; only its history counts as hits
        if i == 0 || i == last {
            continue;
        }
        let (prev, next) = (levels[i - 1], levels[i + 1]);
        if prev == current + 1 && next == current + 1 {
            support_hits += 1;
        }
        if prev == current - 1 && next == current - 1 {
            resistance_hits += 1;
        }
    }

    analysis.same_level_count = same_level_count;
    analysis.support_hits = support_hits;
    analysis.resistance_hits = resistance_hits;
    analysis.support = same_level_count >= MIN_SAME_LEVEL && support_hits >= MIN_ZONE_HITS;
    analysis.resistance = same_level_count >= MIN_SAME_LEVEL && resistance_hits >= MIN_ZONE_HITS;
    analysis
}

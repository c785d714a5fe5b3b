//! Predictive pre-warm recommendations
//!
//! The scaler accumulates (utilization, workload count) observations from
//! the decision engine's ticks, folds them into per-(weekday, hour) cells
//! over a rolling seven-day window, and recommends pre-warming nodes when
//! similar historical cells predict high load with enough confidence.
//! Cells with fewer than three samples yield no pattern, and stale data
//! degrades to "no recommendation" rather than acting on noise.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use fleet_core::state::Trend;
use fleet_core::{Clock, UtilizationPattern};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Days of history folded into patterns
const LOOKBACK_DAYS: i64 = 7;

/// Minimum hours between pattern rebuilds
const REBUILD_INTERVAL_HOURS: i64 = 1;

/// Similarity above which a cell participates in the prediction
const SIMILARITY_THRESHOLD: f64 = 0.7;

/// Predicted utilization above which pre-warming is considered
const PRE_WARM_THRESHOLD: f64 = 0.7;

/// Minimum confidence for a pre-warm recommendation
const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Samples a cell needs before it becomes a pattern
const MIN_CELL_SAMPLES: usize = 3;

/// Hours without observations before the recommender stands down
const STALENESS_LIMIT_HOURS: i64 = 2;

/// GPU workloads one fully warmed node is assumed to absorb when sizing
/// pre-warm capacity
const WORKLOADS_PER_NODE: f64 = 8.0;

/// A pre-warm recommendation, or the reason there is none
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPrediction {
    pub predicted_utilization: f64,
    pub predicted_workloads: u32,
    pub recommended_nodes: u32,
    pub should_pre_warm: bool,
    pub confidence: f64,
    pub reason: String,
    /// Hours until the peak cell's hour, modulo 24; hour granularity is
    /// the contract
    pub hours_until_peak: u32,
}

impl ScalingPrediction {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            predicted_utilization: 0.0,
            predicted_workloads: 0,
            recommended_nodes: 0,
            should_pre_warm: false,
            confidence: 0.0,
            reason: reason.into(),
            hours_until_peak: 0,
        }
    }
}

/// A recurring busy period derived from the pattern table
#[derive(Debug, Clone, PartialEq)]
pub struct BusyPeriod {
    pub day_of_week: Weekday,
    pub start_hour: u32,
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    at: DateTime<Utc>,
    utilization: f64,
    workload_count: u32,
}

#[derive(Debug, Default)]
struct PatternState {
    patterns: Arc<Vec<UtilizationPattern>>,
    last_rebuild: Option<DateTime<Utc>>,
}

/// Historical pattern analysis and pre-warm recommendations
pub struct PredictiveScaler {
    clock: Arc<dyn Clock>,
    observations: RwLock<VecDeque<Observation>>,
    state: RwLock<PatternState>,
}

impl PredictiveScaler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            observations: RwLock::new(VecDeque::new()),
            state: RwLock::new(PatternState::default()),
        }
    }

    /// Feed one tick's cluster observation into the history
    pub fn observe(&self, utilization: f64, workload_count: u32) {
        let now = self.clock.now();
        let mut observations = self.observations.write().unwrap();
        observations.push_back(Observation {
            at: now,
            utilization,
            workload_count,
        });
        let cutoff = now - Duration::days(LOOKBACK_DAYS);
        while observations.front().is_some_and(|o| o.at < cutoff) {
            observations.pop_front();
        }
    }

    /// The current pattern table (last good build)
    pub fn patterns(&self) -> Arc<Vec<UtilizationPattern>> {
        self.state.read().unwrap().patterns.clone()
    }

    /// Predict load for the current time and recommend pre-warming
    pub fn predict(&self) -> ScalingPrediction {
        let now = self.clock.now();
        self.maybe_rebuild(now);

        let newest = self
            .observations
            .read()
            .unwrap()
            .back()
            .map(|o| o.at);
        match newest {
            None => {
                debug!("no utilization history yet, skipping prediction");
                return ScalingPrediction::none("no utilization history");
            }
            Some(at) if now - at > Duration::hours(STALENESS_LIMIT_HOURS) => {
                info!("utilization history is stale, skipping prediction");
                return ScalingPrediction::none("utilization history is stale");
            }
            Some(_) => {}
        }

        let patterns = self.patterns();
        let similar: Vec<&UtilizationPattern> = patterns
            .iter()
            .filter(|p| {
                similarity(p.day_of_week, p.hour_of_day, now.weekday(), now.hour())
                    > SIMILARITY_THRESHOLD
            })
            .collect();

        if similar.is_empty() {
            return ScalingPrediction::none("no similar historical patterns found");
        }

        let predicted_utilization =
            similar.iter().map(|p| p.avg_utilization).sum::<f64>() / similar.len() as f64;
        let predicted_workloads = (similar.iter().map(|p| p.workload_count).sum::<u32>() as f64
            / similar.len() as f64) as u32;
        let confidence = confidence(&similar);

        if predicted_utilization > PRE_WARM_THRESHOLD && confidence > CONFIDENCE_THRESHOLD {
            let recommended_nodes = recommended_nodes(predicted_utilization, predicted_workloads);
            let hours_until_peak = hours_until_peak(&similar, now.hour());
            ScalingPrediction {
                predicted_utilization,
                predicted_workloads,
                recommended_nodes,
                should_pre_warm: true,
                confidence,
                reason: format!(
                    "predicted {:.1}% utilization in {}h (confidence: {:.1}%)",
                    predicted_utilization * 100.0,
                    hours_until_peak,
                    confidence * 100.0
                ),
                hours_until_peak,
            }
        } else {
            ScalingPrediction {
                predicted_utilization,
                predicted_workloads,
                recommended_nodes: 0,
                should_pre_warm: false,
                confidence,
                reason: "no pre-warming needed".to_string(),
                hours_until_peak: 0,
            }
        }
    }

    /// Cells with sustained load, for the pre-warm schedule
    pub fn busy_periods(&self) -> Vec<BusyPeriod> {
        self.patterns()
            .iter()
            .filter(|p| p.avg_utilization > 0.6)
            .map(|p| BusyPeriod {
                day_of_week: p.day_of_week,
                start_hour: p.hour_of_day,
                utilization: p.avg_utilization,
            })
            .collect()
    }

    /// Rebuild the pattern table from observations, at most hourly.
    /// Consumers keep reading the previous table during the swap.
    fn maybe_rebuild(&self, now: DateTime<Utc>) {
        {
            let state = self.state.read().unwrap();
            if let Some(last) = state.last_rebuild {
                if now - last < Duration::hours(REBUILD_INTERVAL_HOURS) {
                    return;
                }
            }
        }

        let observations = self.observations.read().unwrap();
        let mut cells: HashMap<(Weekday, u32), Vec<&Observation>> = HashMap::new();
        for obs in observations.iter() {
            cells
                .entry((obs.at.weekday(), obs.at.hour()))
                .or_default()
                .push(obs);
        }

        let mut patterns = Vec::new();
        for ((day, hour), samples) in cells {
            if samples.len() < MIN_CELL_SAMPLES {
                continue;
            }
            let utilizations: Vec<f64> = samples.iter().map(|o| o.utilization).collect();
            let avg = utilizations.iter().sum::<f64>() / utilizations.len() as f64;
            let peak = utilizations.iter().cloned().fold(0.0, f64::max);
            let workload_count = (samples.iter().map(|o| o.workload_count as u64).sum::<u64>()
                / samples.len() as u64) as u32;

            patterns.push(UtilizationPattern {
                day_of_week: day,
                hour_of_day: hour,
                avg_utilization: avg,
                peak_utilization: peak,
                workload_count,
                trend: Trend::of(&utilizations),
            });
        }
        drop(observations);

        debug!(patterns = patterns.len(), "rebuilt utilization patterns");
        let mut state = self.state.write().unwrap();
        state.patterns = Arc::new(patterns);
        state.last_rebuild = Some(now);
    }
}

/// Similarity between a pattern cell and a target time: 70% weekday
/// match, 30% hour match
fn similarity(
    pattern_day: Weekday,
    pattern_hour: u32,
    target_day: Weekday,
    target_hour: u32,
) -> f64 {
    let day_distance = {
        let a = pattern_day.num_days_from_monday() as i32;
        let b = target_day.num_days_from_monday() as i32;
        let direct = (a - b).abs();
        direct.min(7 - direct)
    };
    let day_similarity = match day_distance {
        0 => 1.0,
        1 => 0.5,
        _ => 0.0,
    };

    let hour_similarity = match (pattern_hour as i32 - target_hour as i32).abs() {
        0 => 1.0,
        1 => 0.7,
        2 => 0.4,
        _ => 0.0,
    };

    day_similarity * 0.7 + hour_similarity * 0.3
}

/// Confidence from pattern agreement: tight cells score high, more cells
/// add a capped bonus
fn confidence(patterns: &[&UtilizationPattern]) -> f64 {
    if patterns.len() < 2 {
        return 0.3;
    }

    let means: Vec<f64> = patterns.iter().map(|p| p.avg_utilization).collect();
    let mean = means.iter().sum::<f64>() / means.len() as f64;
    let variance = means.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / means.len() as f64;
    let std_dev = variance.sqrt();

    let base = (1.0 - std_dev * 2.0).max(0.0);
    let data_boost = (patterns.len() as f64 * 0.05).min(0.2);
    (base + data_boost).min(1.0)
}

/// Nodes to pre-warm for a predicted load
fn recommended_nodes(predicted_utilization: f64, predicted_workloads: u32) -> u32 {
    let base_nodes = (predicted_workloads as f64 / WORKLOADS_PER_NODE).ceil();
    let utilization_factor = predicted_utilization / 0.8;
    (base_nodes * utilization_factor).ceil() as u32
}

/// Hours until the peak cell's hour, wrapping past midnight
fn hours_until_peak(patterns: &[&UtilizationPattern], current_hour: u32) -> u32 {
    let peak = patterns
        .iter()
        .max_by(|a, b| a.peak_utilization.total_cmp(&b.peak_utilization));
    let Some(peak) = peak else {
        return 0;
    };

    let mut hours = peak.hour_of_day as i32 - current_hour as i32;
    if hours < 0 {
        hours += 24;
    }
    hours as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_dev::ManualClock;

    /// A Monday at 09:00
    fn monday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn scaler_at(at: DateTime<Utc>) -> (Arc<ManualClock>, PredictiveScaler) {
        let clock = Arc::new(ManualClock::at(at));
        let scaler = PredictiveScaler::new(clock.clone());
        (clock, scaler)
    }

    /// Feed a week-old morning of observations so the Monday 09:00-11:00
    /// cells all clear the minimum sample count
    fn feed_history(clock: &ManualClock, scaler: &PredictiveScaler, utilization: f64, pods: u32) {
        let origin = clock.now();
        for hour_offset in [0, 1, 2] {
            for minutes in [0, 15, 30, 45] {
                clock.set(
                    origin - Duration::days(7)
                        + Duration::hours(hour_offset)
                        + Duration::minutes(minutes),
                );
                scaler.observe(utilization, pods);
            }
        }
        clock.set(origin);
        // A fresh observation keeps the history from looking stale
        scaler.observe(utilization, pods);
    }

    #[test]
    fn test_similarity_weights() {
        use Weekday::*;
        assert!((similarity(Mon, 9, Mon, 9) - 1.0).abs() < 1e-9);
        assert!((similarity(Tue, 9, Mon, 9) - 0.5 * 0.7 - 0.3).abs() < 1e-9);
        assert!((similarity(Mon, 10, Mon, 9) - (0.7 + 0.3 * 0.7)).abs() < 1e-9);
        assert!((similarity(Thu, 3, Mon, 9) - 0.0).abs() < 1e-9);
        // The week wraps: Sunday and Monday are adjacent
        assert!((similarity(Sun, 9, Mon, 9) - (0.5 * 0.7 + 0.3)).abs() < 1e-9);
    }

    #[test]
    fn test_sparse_cells_yield_no_patterns() {
        let (clock, scaler) = scaler_at(monday_morning());
        // Two samples in one cell stays below the minimum
        clock.set(monday_morning() - Duration::days(1));
        scaler.observe(0.9, 10);
        scaler.observe(0.9, 10);
        clock.set(monday_morning());

        let prediction = scaler.predict();
        assert!(!prediction.should_pre_warm);
        assert!(prediction.reason.contains("no similar historical patterns"));
    }

    #[test]
    fn test_consistent_high_load_recommends_pre_warm() {
        let (clock, scaler) = scaler_at(monday_morning());
        feed_history(&clock, &scaler, 0.85, 20);

        let prediction = scaler.predict();
        assert!(prediction.should_pre_warm, "reason: {}", prediction.reason);
        assert!((prediction.predicted_utilization - 0.85).abs() < 1e-6);
        assert!(prediction.confidence > 0.7);
        // ceil(20/8) * (0.85/0.8) = 3 * 1.0625 -> 4 nodes
        assert_eq!(prediction.recommended_nodes, 4);
    }

    #[test]
    fn test_low_load_does_not_pre_warm() {
        let (clock, scaler) = scaler_at(monday_morning());
        feed_history(&clock, &scaler, 0.3, 4);

        let prediction = scaler.predict();
        assert!(!prediction.should_pre_warm);
        assert_eq!(prediction.reason, "no pre-warming needed");
    }

    #[test]
    fn test_stale_history_stands_down() {
        let (clock, scaler) = scaler_at(monday_morning());
        feed_history(&clock, &scaler, 0.9, 20);

        // Three hours with no observations
        clock.advance(Duration::hours(3));
        let prediction = scaler.predict();
        assert!(!prediction.should_pre_warm);
        assert!(prediction.reason.contains("stale"));
    }

    #[test]
    fn test_rebuild_is_rate_limited() {
        let (clock, scaler) = scaler_at(monday_morning());
        feed_history(&clock, &scaler, 0.85, 16);

        scaler.predict();
        let first_count = scaler.patterns().len();
        assert!(first_count > 0);

        // New observations within the hour do not rebuild
        scaler.observe(0.1, 1);
        scaler.predict();
        assert_eq!(scaler.patterns().len(), first_count);
    }

    #[test]
    fn test_busy_periods() {
        let (clock, scaler) = scaler_at(monday_morning());
        feed_history(&clock, &scaler, 0.85, 16);
        scaler.predict();

        let periods = scaler.busy_periods();
        assert!(!periods.is_empty());
        assert!(periods.iter().all(|p| p.utilization > 0.6));
    }
}

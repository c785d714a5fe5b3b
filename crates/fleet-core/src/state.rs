//! Derived in-memory state shared between reconcilers
//!
//! These structures are computed by the controller, never declared by
//! operators: per-workload cost records, historical utilization patterns
//! for the predictive scaler, and the scaling-event history ring.

use crate::types::{CapacityClass, ScalingAction, SharingMode, WorkloadRef};
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cost record for one running GPU workload.
///
/// Entries are shared with concurrent readers (metrics export, budget
/// queries) behind `Arc`, so the accrual writer must never mutate a
/// stored record in place: clone, extend, and swap the pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodCost {
    pub workload: WorkloadRef,
    pub node: String,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub capacity_class: CapacityClass,
    pub sharing_mode: SharingMode,
    pub start_time: DateTime<Utc>,

    /// Current accrual rate in currency units per hour
    pub hourly_rate: f64,

    /// Cumulative accrued cost in currency units; monotonically
    /// non-decreasing over the workload's lifetime
    pub total_cost: f64,

    pub last_updated: DateTime<Utc>,

    /// Attribution labels copied verbatim from the workload
    pub labels: BTreeMap<String, String>,
    pub team: String,
    pub project: String,
    pub experiment_id: String,
    pub cost_center: String,
}

impl PodCost {
    /// Return a copy extended by the accrual since `last_updated`.
    /// The delta is `hourly_rate * Δt`; a negative clock step yields a
    /// zero delta rather than a shrinking total.
    pub fn accrued(&self, now: DateTime<Utc>) -> PodCost {
        let elapsed_hours = (now - self.last_updated)
            .num_milliseconds()
            .max(0) as f64
            / 3_600_000.0;
        let mut next = self.clone();
        next.total_cost += self.hourly_rate * elapsed_hours;
        next.last_updated = now;
        next
    }
}

/// Linear trend of a utilization series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

impl Trend {
    /// Classify a series by simple linear regression slope
    pub fn of(values: &[f64]) -> Trend {
        if values.len() < 3 {
            return Trend::Stable;
        }

        let n = values.len() as f64;
        let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
        for (i, y) in values.iter().enumerate() {
            let x = i as f64;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_x2 += x * x;
        }

        let denom = n * sum_x2 - sum_x * sum_x;
        if denom == 0.0 {
            return Trend::Stable;
        }
        let slope = (n * sum_xy - sum_x * sum_y) / denom;

        if slope > 0.05 {
            Trend::Increasing
        } else if slope < -0.05 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

/// Historical utilization for one (weekday, hour) cell, computed over a
/// rolling seven-day window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationPattern {
    pub day_of_week: Weekday,
    pub hour_of_day: u32,
    pub avg_utilization: f64,
    pub peak_utilization: f64,
    pub workload_count: u32,
    pub trend: Trend,
}

/// A recorded scaling action; the autoscaler keeps the last 100
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: ScalingAction,
    pub reason: String,
    pub node_count: u32,
    pub capacity_class: CapacityClass,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_cost(rate: f64, at: DateTime<Utc>) -> PodCost {
        PodCost {
            workload: WorkloadRef::new("ns", "w"),
            node: "node-1".into(),
            gpu_type: "nvidia-tesla-a100".into(),
            gpu_count: 1,
            capacity_class: CapacityClass::OnDemand,
            sharing_mode: SharingMode::Exclusive,
            start_time: at,
            hourly_rate: rate,
            total_cost: 0.0,
            last_updated: at,
            labels: BTreeMap::new(),
            team: String::new(),
            project: String::new(),
            experiment_id: String::new(),
            cost_center: String::new(),
        }
    }

    #[test]
    fn test_accrual_is_rate_times_elapsed() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let cost = sample_cost(3.0, t0);

        let t1 = t0 + chrono::Duration::minutes(10);
        let next = cost.accrued(t1);
        assert!((next.total_cost - 0.5).abs() < 1e-9);
        assert_eq!(next.last_updated, t1);

        // Chained accruals stay consistent with a single long one
        let t2 = t1 + chrono::Duration::minutes(50);
        let chained = next.accrued(t2);
        assert!((chained.total_cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_accrual_never_decreases() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let cost = sample_cost(3.0, t0);

        // Clock stepping backwards must not shrink the total
        let earlier = t0 - chrono::Duration::minutes(5);
        let next = cost.accrued(earlier);
        assert!(next.total_cost >= cost.total_cost);
    }

    #[test]
    fn test_trend_detection() {
        assert_eq!(Trend::of(&[0.1, 0.3, 0.5, 0.7]), Trend::Increasing);
        assert_eq!(Trend::of(&[0.7, 0.5, 0.3, 0.1]), Trend::Decreasing);
        assert_eq!(Trend::of(&[0.5, 0.5, 0.5, 0.5]), Trend::Stable);
        // Short series default to stable
        assert_eq!(Trend::of(&[0.1, 0.9]), Trend::Stable);
    }
}

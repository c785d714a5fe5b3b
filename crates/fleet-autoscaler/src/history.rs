//! Bounded history of scaling events
//!
//! A ring of the last hundred events with a single writer (the decision
//! engine) and any number of readers (status building, debugging).

use fleet_core::{CapacityClass, ScalingAction, ScalingEvent};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::RwLock;
use uuid::Uuid;

const HISTORY_CAPACITY: usize = 100;

/// Ring buffer of recent scaling events
#[derive(Debug, Default)]
pub struct ScalingHistory {
    events: RwLock<VecDeque<ScalingEvent>>,
}

impl ScalingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, dropping the oldest past capacity
    pub fn record(
        &self,
        timestamp: DateTime<Utc>,
        action: ScalingAction,
        reason: impl Into<String>,
        node_count: u32,
        capacity_class: CapacityClass,
        success: bool,
    ) {
        let mut events = self.events.write().unwrap();
        if events.len() == HISTORY_CAPACITY {
            events.pop_front();
        }
        events.push_back(ScalingEvent {
            id: Uuid::new_v4().to_string(),
            timestamp,
            action,
            reason: reason.into(),
            node_count,
            capacity_class,
            success,
        });
    }

    /// Most recent events, newest last
    pub fn recent(&self, limit: usize) -> Vec<ScalingEvent> {
        let events = self.events.read().unwrap();
        events.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let history = ScalingHistory::new();
        for i in 0..150 {
            history.record(
                Utc::now(),
                ScalingAction::ScaleUp,
                format!("event {}", i),
                i,
                CapacityClass::Spot,
                true,
            );
        }

        assert_eq!(history.len(), 100);
        let recent = history.recent(5);
        assert_eq!(recent.len(), 5);
        // The oldest fifty were dropped
        assert_eq!(recent.last().unwrap().reason, "event 149");
        assert_eq!(history.recent(1000).first().unwrap().reason, "event 50");
    }
}

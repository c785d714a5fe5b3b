//! A settable clock for deterministic tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use fleet_core::Clock;
use std::sync::Mutex;

/// Clock whose time only moves when a test advances it
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at an arbitrary fixed instant
    pub fn new() -> Self {
        Self::at(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::minutes(3));
        assert_eq!(clock.now(), t0 + Duration::minutes(3));

        let fixed = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        clock.set(fixed);
        assert_eq!(clock.now(), fixed);
    }
}

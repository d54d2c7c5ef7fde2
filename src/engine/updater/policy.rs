//! Install Timing Policy
//!
//! Decides whether an available update may be installed now. Scheduled updates
//! wait for the device's local maintenance window; urgent updates wait until
//! the device has been idle long enough.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;

use crate::engine::config::WindowConfig;
use crate::engine::models::UpdatePolicy;

/// Daily `[start, end)` window in local hours, wrapping past midnight when
/// `end < start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl MaintenanceWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            false
        }
    }
}

impl From<WindowConfig> for MaintenanceWindow {
    fn from(config: WindowConfig) -> Self {
        Self {
            start_hour: config.start_hour,
            end_hour: config.end_hour,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    OutsideWindow { local_hour: u32 },
    NotIdle { idle_for: Duration, required: Duration },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideWindow { local_hour } => {
                write!(f, "local hour {} is outside the maintenance window", local_hour)
            }
            Self::NotIdle { idle_for, required } => write!(
                f,
                "idle for {} min, {} min required",
                idle_for.as_secs() / 60,
                required.as_secs() / 60
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Defer(DeferReason),
}

#[derive(Debug, Clone)]
pub struct TimingPolicy {
    pub timezone: Tz,
    pub window: MaintenanceWindow,
    pub urgent_idle: Duration,
}

impl TimingPolicy {
    pub fn evaluate(
        &self,
        policy: UpdatePolicy,
        now: DateTime<Utc>,
        idle_for: Duration,
    ) -> Decision {
        match policy {
            UpdatePolicy::Scheduled => {
                let local_hour = now.with_timezone(&self.timezone).hour();
                if self.window.contains(local_hour) {
                    Decision::Proceed
                } else {
                    Decision::Defer(DeferReason::OutsideWindow { local_hour })
                }
            }
            UpdatePolicy::Urgent => {
                if idle_for >= self.urgent_idle {
                    Decision::Proceed
                } else {
                    Decision::Defer(DeferReason::NotIdle {
                        idle_for,
                        required: self.urgent_idle,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(timezone: Tz) -> TimingPolicy {
        TimingPolicy {
            timezone,
            window: WindowConfig::default().into(),
            urgent_idle: Duration::from_secs(60 * 60),
        }
    }

    #[test]
    fn test_window_wraps_midnight() {
        let window = MaintenanceWindow {
            start_hour: 23,
            end_hour: 4,
        };
        assert!(window.contains(23));
        assert!(window.contains(0));
        assert!(window.contains(3));
        assert!(!window.contains(4));
        assert!(!window.contains(12));

        let plain = MaintenanceWindow {
            start_hour: 2,
            end_hour: 5,
        };
        assert!(plain.contains(2));
        assert!(!plain.contains(5));
        assert!(!plain.contains(1));
    }

    #[test]
    fn test_scheduled_uses_device_timezone() {
        let policy = policy(chrono_tz::America::Los_Angeles);
        // 10:30 UTC in January is 02:30 in Los Angeles
        let inside = Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(
            policy.evaluate(UpdatePolicy::Scheduled, inside, Duration::ZERO),
            Decision::Proceed
        );

        // 03:00 UTC is 19:00 the previous evening locally
        let outside = Utc.with_ymd_and_hms(2026, 1, 15, 3, 0, 0).unwrap();
        assert_eq!(
            policy.evaluate(UpdatePolicy::Scheduled, outside, Duration::ZERO),
            Decision::Defer(DeferReason::OutsideWindow { local_hour: 19 })
        );
    }

    #[test]
    fn test_urgent_waits_for_idle() {
        let policy = policy(chrono_tz::UTC);
        let noon = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();

        let thirty = Duration::from_secs(30 * 60);
        assert!(matches!(
            policy.evaluate(UpdatePolicy::Urgent, noon, thirty),
            Decision::Defer(DeferReason::NotIdle { .. })
        ));

        let sixty_one = Duration::from_secs(61 * 60);
        assert_eq!(
            policy.evaluate(UpdatePolicy::Urgent, noon, sixty_one),
            Decision::Proceed
        );
    }
}

//! Policy engine: retry backoff, reporting cadence and the battery model
//!
//! Plain value types so tests can swap in tighter budgets without touching
//! the components they drive.

use std::time::Duration;

/// Exponential backoff with a cap and an attempt budget
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retry number `attempts` (1-based); non-decreasing in
    /// `attempts` and never above `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// When and how often telemetry is reported
#[derive(Debug, Clone)]
pub struct ReportingPolicy {
    pub moving_heartbeat: Duration,
    pub stationary_heartbeat: Duration,
    pub report_motion_changes: bool,
    pub battery_delta_pct: f64,
}

impl Default for ReportingPolicy {
    fn default() -> Self {
        Self {
            moving_heartbeat: Duration::from_secs(60),
            stationary_heartbeat: Duration::from_secs(300),
            report_motion_changes: true,
            battery_delta_pct: 5.0,
        }
    }
}

impl ReportingPolicy {
    pub fn heartbeat_interval(&self, in_motion: bool) -> Duration {
        if in_motion {
            self.moving_heartbeat
        } else {
            self.stationary_heartbeat
        }
    }

    pub fn should_report_motion_change(&self) -> bool {
        self.report_motion_changes
    }

    pub fn should_report_battery(&self, current_pct: f64, last_reported_pct: f64) -> bool {
        (current_pct - last_reported_pct).abs() >= self.battery_delta_pct
    }
}

/// Battery drain model and the low-power threshold
#[derive(Debug, Clone)]
pub struct PowerPolicy {
    pub stationary_drain_pct_per_hour: f64,
    pub moving_drain_pct_per_hour: f64,
    pub connected_drain_multiplier: f64,
    pub low_battery_threshold_pct: f64,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self {
            stationary_drain_pct_per_hour: 0.1,
            moving_drain_pct_per_hour: 0.5,
            connected_drain_multiplier: 1.2,
            low_battery_threshold_pct: 15.0,
        }
    }
}

impl PowerPolicy {
    pub fn drain_rate(&self, in_motion: bool, connected: bool) -> f64 {
        let base = if in_motion {
            self.moving_drain_pct_per_hour
        } else {
            self.stationary_drain_pct_per_hour
        };
        if connected {
            base * self.connected_drain_multiplier
        } else {
            base
        }
    }

    pub fn should_enter_low_power(&self, battery_pct: f64) -> bool {
        battery_pct <= self.low_battery_threshold_pct
    }
}

/// Read-only bundle of the three policies
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    pub retry: RetryPolicy,
    pub reporting: ReportingPolicy,
    pub power: PowerPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();

        let mut previous = Duration::ZERO;
        for attempts in 1..40 {
            let delay = policy.backoff(attempts);
            assert!(delay >= previous, "backoff must be non-decreasing");
            assert!(delay <= Duration::from_secs(300), "backoff must stay capped");
            previous = delay;
        }
        assert_eq!(policy.backoff(100), Duration::from_secs(300));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn test_heartbeat_interval_by_motion() {
        let policy = ReportingPolicy::default();
        assert_eq!(policy.heartbeat_interval(true), Duration::from_secs(60));
        assert_eq!(policy.heartbeat_interval(false), Duration::from_secs(300));
    }

    #[test]
    fn test_battery_reporting_threshold() {
        let policy = ReportingPolicy::default();
        assert!(policy.should_report_battery(90.0, 100.0));
        assert!(policy.should_report_battery(95.0, 90.0));
        assert!(!policy.should_report_battery(97.0, 100.0));
    }

    #[test]
    fn test_drain_rate() {
        let policy = PowerPolicy::default();
        assert_eq!(policy.drain_rate(false, false), 0.1);
        assert_eq!(policy.drain_rate(true, false), 0.5);
        assert!((policy.drain_rate(false, true) - 0.12).abs() < 1e-9);
        assert!((policy.drain_rate(true, true) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_low_power_threshold() {
        let policy = PowerPolicy::default();
        assert!(policy.should_enter_low_power(15.0));
        assert!(policy.should_enter_low_power(3.0));
        assert!(!policy.should_enter_low_power(15.1));
    }
}

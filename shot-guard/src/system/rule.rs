use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Process-wide protection thresholds for inbound traffic. A negative
/// value leaves the measure unchecked.
///
/// ```rust
/// use shot_guard::system::SystemRule;
///
/// let rule: SystemRule = serde_json::from_str(r#"{ "qps": 200, "max_thread": 50 }"#).unwrap();
/// assert_eq!(rule.qps, 200.0);
/// assert!(rule.avg_rt < 0.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemRule {
    pub highest_system_load: f64,
    /// Fraction in `[0, 1]`.
    pub highest_cpu_usage: f64,
    pub qps: f64,
    /// Milliseconds.
    pub avg_rt: f64,
    pub max_thread: f64,
}

impl Default for SystemRule {
    fn default() -> Self {
        Self {
            highest_system_load: -1.0,
            highest_cpu_usage: -1.0,
            qps: -1.0,
            avg_rt: -1.0,
            max_thread: -1.0,
        }
    }
}

impl SystemRule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            self.highest_system_load,
            self.highest_cpu_usage,
            self.qps,
            self.avg_rt,
            self.max_thread,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::rule("system", "thresholds must be finite"));
        }
        if self.highest_cpu_usage > 1.0 {
            return Err(ConfigError::rule("system", "highest_cpu_usage must be within [0, 1]"));
        }
        if fields.iter().all(|v| *v < 0.0) {
            return Err(ConfigError::rule("system", "rule sets no threshold"));
        }
        Ok(())
    }

    /// The strictest combination of `self` and `other`.
    pub fn merge(&self, other: &SystemRule) -> SystemRule {
        fn strictest(a: f64, b: f64) -> f64 {
            match (a >= 0.0, b >= 0.0) {
                (true, true) => a.min(b),
                (true, false) => a,
                (false, _) => b,
            }
        }
        SystemRule {
            highest_system_load: strictest(self.highest_system_load, other.highest_system_load),
            highest_cpu_usage: strictest(self.highest_cpu_usage, other.highest_cpu_usage),
            qps: strictest(self.qps, other.qps),
            avg_rt: strictest(self.avg_rt, other.avg_rt),
            max_thread: strictest(self.max_thread, other.max_thread),
        }
    }
}

/// The measure a system rule blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMetric {
    Qps,
    Thread,
    Rt,
    Load,
    Cpu,
}

impl fmt::Display for SystemMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemMetric::Qps => "qps",
            SystemMetric::Thread => "thread",
            SystemMetric::Rt => "rt",
            SystemMetric::Load => "load",
            SystemMetric::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_the_minimum_of_set_thresholds() {
        let a = SystemRule {
            qps: 100.0,
            max_thread: 20.0,
            ..Default::default()
        };
        let b = SystemRule {
            qps: 50.0,
            avg_rt: 30.0,
            ..Default::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.qps, 50.0);
        assert_eq!(merged.max_thread, 20.0);
        assert_eq!(merged.avg_rt, 30.0);
        assert!(merged.highest_system_load < 0.0);
    }

    #[test]
    fn empty_rule_is_invalid() {
        assert!(SystemRule::default().validate().is_err());
        let cpu = SystemRule {
            highest_cpu_usage: 1.5,
            ..Default::default()
        };
        assert!(cpu.validate().is_err());
    }
}

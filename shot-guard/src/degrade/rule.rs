use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// What a circuit breaker measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakerStrategy {
    /// Calls slower than `max_allowed_rt_ms` count as slow; trips when the
    /// slow ratio reaches `threshold`.
    SlowRequestRatio { max_allowed_rt_ms: u64, threshold: f64 },
    /// Trips when the share of failed calls reaches `threshold`.
    ErrorRatio { threshold: f64 },
    /// Trips when the number of failed calls reaches `threshold`.
    ErrorCount { threshold: f64 },
}

impl Default for BreakerStrategy {
    fn default() -> Self {
        BreakerStrategy::SlowRequestRatio {
            max_allowed_rt_ms: 1000,
            threshold: 1.0,
        }
    }
}

/// A circuit breaking rule.
///
/// ```rust
/// use shot_guard::degrade::BreakerStrategy;
/// use shot_guard::degrade::DegradeRule;
///
/// let rule: DegradeRule = serde_json::from_str(
///     r#"{
///         "resource": "orders",
///         "strategy": { "kind": "error_ratio", "threshold": 0.5 },
///         "recovery_timeout_ms": 2000
///     }"#,
/// )
/// .unwrap();
/// assert_eq!(rule.strategy, BreakerStrategy::ErrorRatio { threshold: 0.5 });
/// assert_eq!(rule.min_request_amount, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradeRule {
    pub resource: String,
    pub strategy: BreakerStrategy,
    /// How long the breaker stays open before letting a probe through.
    pub recovery_timeout_ms: u64,
    /// When set, each consecutive failed probe doubles the recovery timeout
    /// up to this value.
    pub max_recovery_timeout_ms: Option<u64>,
    /// Fewer calls than this in the window never trip the breaker.
    pub min_request_amount: u64,
    pub stat_interval_ms: u64,
    /// Only trip while the resource is judged overloaded.
    pub scenario_check: bool,
}

impl Default for DegradeRule {
    fn default() -> Self {
        Self {
            resource: String::new(),
            strategy: BreakerStrategy::default(),
            recovery_timeout_ms: 5000,
            max_recovery_timeout_ms: None,
            min_request_amount: 5,
            stat_interval_ms: 1000,
            scenario_check: false,
        }
    }
}

impl DegradeRule {
    pub fn new(resource: impl Into<String>, strategy: BreakerStrategy) -> Self {
        Self {
            resource: resource.into(),
            strategy,
            ..Default::default()
        }
    }

    pub fn with_recovery_timeout_ms(mut self, ms: u64) -> Self {
        self.recovery_timeout_ms = ms;
        self
    }

    pub fn with_max_recovery_timeout_ms(mut self, ms: u64) -> Self {
        self.max_recovery_timeout_ms = Some(ms);
        self
    }

    pub fn with_min_request_amount(mut self, amount: u64) -> Self {
        self.min_request_amount = amount;
        self
    }

    pub fn with_stat_interval_ms(mut self, ms: u64) -> Self {
        self.stat_interval_ms = ms;
        self
    }

    pub fn with_scenario_check(mut self, enabled: bool) -> Self {
        self.scenario_check = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::rule(&self.resource, reason));

        if self.resource.trim().is_empty() {
            return invalid("resource must not be empty");
        }
        match self.strategy {
            BreakerStrategy::SlowRequestRatio {
                max_allowed_rt_ms,
                threshold,
            } => {
                if max_allowed_rt_ms == 0 {
                    return invalid("max_allowed_rt_ms must be positive");
                }
                if !(0.0..=1.0).contains(&threshold) {
                    return invalid("slow request ratio must be within [0, 1]");
                }
            }
            BreakerStrategy::ErrorRatio { threshold } => {
                if !(0.0..=1.0).contains(&threshold) {
                    return invalid("error ratio must be within [0, 1]");
                }
            }
            BreakerStrategy::ErrorCount { threshold } => {
                if !threshold.is_finite() || threshold < 0.0 {
                    return invalid("error count must not be negative");
                }
            }
        }
        if self.recovery_timeout_ms == 0 {
            return invalid("recovery_timeout_ms must be positive");
        }
        if self
            .max_recovery_timeout_ms
            .is_some_and(|max| max < self.recovery_timeout_ms)
        {
            return invalid("max_recovery_timeout_ms must not be below recovery_timeout_ms");
        }
        if self.min_request_amount == 0 {
            return invalid("min_request_amount must be positive");
        }
        if self.stat_interval_ms == 0 {
            return invalid("stat_interval_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rule_needs_a_resource() {
        assert!(DegradeRule::default().validate().is_err());
        assert!(
            DegradeRule::new("a", BreakerStrategy::default())
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn ratios_are_bounded() {
        let rule = DegradeRule::new("a", BreakerStrategy::ErrorRatio { threshold: 1.5 });
        assert!(rule.validate().is_err());
        let rule = DegradeRule::new(
            "a",
            BreakerStrategy::SlowRequestRatio {
                max_allowed_rt_ms: 0,
                threshold: 0.5,
            },
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn backoff_ceiling_must_cover_the_timeout() {
        let rule = DegradeRule::new("a", BreakerStrategy::ErrorCount { threshold: 3.0 })
            .with_recovery_timeout_ms(1000)
            .with_max_recovery_timeout_ms(500);
        assert!(rule.validate().is_err());
    }
}

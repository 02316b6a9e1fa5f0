use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Origin selector matching every caller.
pub const LIMIT_APP_DEFAULT: &str = "default";
/// Origin selector matching callers that no other rule of the resource names.
pub const LIMIT_APP_OTHER: &str = "other";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowGrade {
    /// Concurrent calls in flight.
    Thread,
    #[default]
    Qps,
}

/// Which node a rule reads its statistics from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStrategy {
    /// The resource itself (or its origin breakdown).
    #[default]
    Direct,
    /// The cluster node of `ref_resource`.
    Relate,
    /// The resource under the context named by `ref_resource` only.
    Chain,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlBehavior {
    #[default]
    Reject,
    WarmUp,
    Throttling,
    WarmUpThrottling,
    LeakyBucket,
    /// A controller registered under this alias.
    Custom(String),
}

/// A flow rule. Immutable once loaded.
///
/// ```rust
/// use shot_guard::flow::FlowRule;
///
/// let rule: FlowRule = serde_json::from_str(
///     r#"{ "resource": "orders", "count": 20, "control_behavior": "throttling" }"#,
/// )
/// .unwrap();
/// assert!(rule.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRule {
    pub resource: String,
    pub limit_app: String,
    pub grade: FlowGrade,
    pub count: f64,
    pub strategy: FlowStrategy,
    pub ref_resource: Option<String>,
    pub control_behavior: ControlBehavior,
    pub warm_up_period_sec: u32,
    /// Falls back to the engine's `cold_factor` when unset.
    pub cold_factor: Option<u32>,
    pub max_queueing_time_ms: u64,
    pub stat_interval_ms: u64,
}

impl Default for FlowRule {
    fn default() -> Self {
        Self {
            resource: String::new(),
            limit_app: LIMIT_APP_DEFAULT.to_string(),
            grade: FlowGrade::Qps,
            count: 0.0,
            strategy: FlowStrategy::Direct,
            ref_resource: None,
            control_behavior: ControlBehavior::Reject,
            warm_up_period_sec: 10,
            cold_factor: None,
            max_queueing_time_ms: 500,
            stat_interval_ms: 1000,
        }
    }
}

impl FlowRule {
    pub fn new(resource: impl Into<String>, grade: FlowGrade, count: f64) -> Self {
        Self {
            resource: resource.into(),
            grade,
            count,
            ..Self::default()
        }
    }

    pub fn with_control_behavior(mut self, behavior: ControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    pub fn with_limit_app(mut self, limit_app: impl Into<String>) -> Self {
        self.limit_app = limit_app.into();
        self
    }

    pub fn with_strategy(mut self, strategy: FlowStrategy, ref_resource: impl Into<String>) -> Self {
        self.strategy = strategy;
        self.ref_resource = Some(ref_resource.into());
        self
    }

    pub fn with_max_queueing_time_ms(mut self, ms: u64) -> Self {
        self.max_queueing_time_ms = ms;
        self
    }

    pub fn with_warm_up(mut self, period_sec: u32, cold_factor: Option<u32>) -> Self {
        self.warm_up_period_sec = period_sec;
        self.cold_factor = cold_factor;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::rule(&self.resource, reason));

        if self.resource.trim().is_empty() {
            return invalid("resource must not be empty");
        }
        if self.limit_app.trim().is_empty() {
            return invalid("limit_app must not be empty");
        }
        if !self.count.is_finite() || self.count < 0.0 {
            return invalid("count must be a non-negative number");
        }
        if self.stat_interval_ms == 0 {
            return invalid("stat_interval_ms must be positive");
        }
        if self.strategy != FlowStrategy::Direct
            && self.ref_resource.as_deref().is_none_or(|r| r.trim().is_empty())
        {
            return invalid("relate and chain strategies need a ref_resource");
        }
        if matches!(
            self.control_behavior,
            ControlBehavior::WarmUp | ControlBehavior::WarmUpThrottling
        ) && self.warm_up_period_sec == 0
        {
            return invalid("warm_up_period_sec must be positive");
        }
        if self.cold_factor.is_some_and(|f| f <= 1) {
            return invalid("cold_factor must be greater than 1");
        }
        if let ControlBehavior::Custom(alias) = &self.control_behavior
            && alias.trim().is_empty()
        {
            return invalid("custom control behavior needs an alias");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_json() {
        let rule: FlowRule = serde_json::from_str(r#"{ "resource": "svc", "count": 1 }"#).unwrap();
        assert_eq!(rule.limit_app, LIMIT_APP_DEFAULT);
        assert_eq!(rule.grade, FlowGrade::Qps);
        assert_eq!(rule.control_behavior, ControlBehavior::Reject);
        assert!(rule.validate().is_ok());

        let rule: FlowRule =
            serde_json::from_str(r#"{ "resource": "svc", "control_behavior": { "custom": "mine" } }"#)
                .unwrap();
        assert_eq!(rule.control_behavior, ControlBehavior::Custom("mine".into()));
    }

    #[test]
    fn invalid_rules() {
        assert!(FlowRule::new("", FlowGrade::Qps, 1.0).validate().is_err());
        assert!(FlowRule::new("svc", FlowGrade::Qps, -1.0).validate().is_err());
        assert!(FlowRule::new("svc", FlowGrade::Qps, f64::NAN).validate().is_err());

        let mut rule = FlowRule::new("svc", FlowGrade::Qps, 1.0);
        rule.strategy = FlowStrategy::Relate;
        assert!(rule.validate().is_err());

        let rule = FlowRule::new("svc", FlowGrade::Qps, 1.0)
            .with_control_behavior(ControlBehavior::WarmUp)
            .with_warm_up(0, None);
        assert!(rule.validate().is_err());

        let rule = FlowRule::new("svc", FlowGrade::Qps, 1.0).with_warm_up(10, Some(1));
        assert!(rule.validate().is_err());
    }
}

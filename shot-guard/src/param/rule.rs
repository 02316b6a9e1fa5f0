use serde::Deserialize;
use serde::Serialize;

use super::ParamValue;
use crate::error::ConfigError;
use crate::flow::FlowGrade;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamControlBehavior {
    /// Token bucket per value: `count` tokens per `duration_sec`, plus burst.
    #[default]
    Reject,
    /// Uniform spacing per value.
    Throttling,
}

/// A threshold overriding the rule's `count` for one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowItem {
    pub value: ParamValue,
    pub count: f64,
}

/// Limits calls per distinct value of one argument.
///
/// ```rust
/// use shot_guard::param::ParamFlowRule;
///
/// let rule: ParamFlowRule = serde_json::from_str(
///     r#"{
///         "resource": "lookup",
///         "param_idx": 0,
///         "count": 5,
///         "specific_items": [{ "value": "vip", "count": 50 }]
///     }"#,
/// )
/// .unwrap();
/// assert_eq!(rule.threshold_for(&"vip".into()), 50.0);
/// assert_eq!(rule.threshold_for(&"guest".into()), 5.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamFlowRule {
    pub resource: String,
    /// Position of the argument; negative counts from the end.
    pub param_idx: isize,
    pub grade: FlowGrade,
    pub count: f64,
    /// Extra tokens a value may spend on top of `count`.
    pub burst_count: u64,
    pub duration_sec: u64,
    pub control_behavior: ParamControlBehavior,
    pub max_queueing_time_ms: u64,
    pub specific_items: Vec<ParamFlowItem>,
}

impl Default for ParamFlowRule {
    fn default() -> Self {
        Self {
            resource: String::new(),
            param_idx: 0,
            grade: FlowGrade::Qps,
            count: 0.0,
            burst_count: 0,
            duration_sec: 1,
            control_behavior: ParamControlBehavior::Reject,
            max_queueing_time_ms: 0,
            specific_items: Vec::new(),
        }
    }
}

impl ParamFlowRule {
    pub fn new(resource: impl Into<String>, param_idx: isize, grade: FlowGrade, count: f64) -> Self {
        Self {
            resource: resource.into(),
            param_idx,
            grade,
            count,
            ..Default::default()
        }
    }

    pub fn with_burst_count(mut self, burst: u64) -> Self {
        self.burst_count = burst;
        self
    }

    pub fn with_duration_sec(mut self, duration: u64) -> Self {
        self.duration_sec = duration;
        self
    }

    pub fn with_throttling(mut self, max_queueing_time_ms: u64) -> Self {
        self.control_behavior = ParamControlBehavior::Throttling;
        self.max_queueing_time_ms = max_queueing_time_ms;
        self
    }

    pub fn with_item(mut self, value: impl Into<ParamValue>, count: f64) -> Self {
        self.specific_items.push(ParamFlowItem {
            value: value.into(),
            count,
        });
        self
    }

    pub fn threshold_for(&self, value: &ParamValue) -> f64 {
        self.specific_items
            .iter()
            .find(|item| &item.value == value)
            .map_or(self.count, |item| item.count)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::rule(&self.resource, reason));

        if self.resource.trim().is_empty() {
            return invalid("resource must not be empty");
        }
        if !self.count.is_finite() || self.count < 0.0 {
            return invalid("count must not be negative");
        }
        if self.duration_sec == 0 {
            return invalid("duration_sec must be positive");
        }
        if self
            .specific_items
            .iter()
            .any(|item| !item.count.is_finite() || item.count < 0.0)
        {
            return invalid("item counts must not be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(ParamFlowRule::new("a", 0, FlowGrade::Qps, 5.0).validate().is_ok());
        assert!(ParamFlowRule::new("", 0, FlowGrade::Qps, 5.0).validate().is_err());
        assert!(
            ParamFlowRule::new("a", 0, FlowGrade::Qps, 5.0)
                .with_duration_sec(0)
                .validate()
                .is_err()
        );
        assert!(
            ParamFlowRule::new("a", 0, FlowGrade::Qps, 5.0)
                .with_item(1, -1.0)
                .validate()
                .is_err()
        );
    }
}

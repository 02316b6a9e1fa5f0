use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::ParamControlBehavior;
use super::ParamFlowRule;
use super::ParamValue;
use super::ParameterMetric;
use crate::clock::CancelToken;
use crate::clock::TimeSource;
use crate::error::ConfigError;
use crate::flow::FlowGrade;
use crate::rule::LoadOutcome;
use crate::rule::RuleMap;
use crate::rule::group_by_resource;

/// A loaded parameter rule with its per-value state.
#[derive(Debug)]
pub struct ParamFlowCheck {
    pub rule: Arc<ParamFlowRule>,
    pub metric: Arc<ParameterMetric>,
}

impl ParamFlowCheck {
    pub fn pass(
        &self,
        time: &TimeSource,
        value: &ParamValue,
        acquire: u32,
        cancel: Option<&CancelToken>,
    ) -> bool {
        let rule = &self.rule;
        let threshold = rule.threshold_for(value);
        let duration_ms = rule.duration_sec.saturating_mul(1000);
        match (rule.grade, rule.control_behavior) {
            (FlowGrade::Thread, _) => (self.metric.thread_count(value) + 1) as f64 <= threshold,
            (FlowGrade::Qps, ParamControlBehavior::Reject) => self.metric.pass_tokens(
                time.now_ms(),
                value,
                threshold,
                rule.burst_count,
                duration_ms,
                acquire,
            ),
            (FlowGrade::Qps, ParamControlBehavior::Throttling) => self.metric.pass_throttled(
                time,
                value,
                threshold,
                duration_ms,
                rule.max_queueing_time_ms,
                acquire,
                cancel,
            ),
        }
    }
}

/// Holds the active hot-parameter rules.
#[derive(Debug, Default)]
pub struct ParamFlowRuleManager {
    checks: RuleMap<ParamFlowCheck>,
}

impl ParamFlowRuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every parameter rule. Unchanged rules keep their per-value
    /// state.
    pub fn load_rules(&self, rules: Vec<ParamFlowRule>) -> Result<LoadOutcome, ConfigError> {
        let old = self.checks.snapshot();
        let checks = build_checks(rules, &old)?;
        let current = checks.len();
        let previous = self
            .checks
            .replace_all(group_by_resource(checks, |c| &c.rule.resource))
            .values()
            .map(Vec::len)
            .sum();
        info!(previous, current, "parameter flow rules loaded");
        Ok(LoadOutcome { previous, current })
    }

    pub fn load_rules_of_resource(
        &self,
        resource: &str,
        rules: Vec<ParamFlowRule>,
    ) -> Result<LoadOutcome, ConfigError> {
        if let Some(stray) = rules.iter().find(|r| r.resource != resource) {
            return Err(ConfigError::rule(
                &stray.resource,
                format!("rule does not belong to `{resource}`"),
            ));
        }
        let old = self.checks.snapshot();
        let checks = build_checks(rules, &old)?;
        let current = checks.len();
        let previous = self.checks.replace_resource(resource, checks);
        info!(resource, previous, current, "parameter flow rules of resource loaded");
        Ok(LoadOutcome { previous, current })
    }

    pub fn checks(&self, resource: &str) -> Vec<Arc<ParamFlowCheck>> {
        self.checks.get(resource)
    }

    pub fn rules(&self) -> Vec<ParamFlowRule> {
        let snapshot = self.checks.snapshot();
        let mut resources: Vec<_> = snapshot.keys().collect();
        resources.sort();
        resources
            .into_iter()
            .flat_map(|r| snapshot[r].iter().map(|c| ParamFlowRule::clone(&c.rule)))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.checks.count()
    }
}

fn build_checks(
    rules: Vec<ParamFlowRule>,
    old: &HashMap<String, Vec<Arc<ParamFlowCheck>>>,
) -> Result<Vec<Arc<ParamFlowCheck>>, ConfigError> {
    let mut checks: Vec<Arc<ParamFlowCheck>> = Vec::with_capacity(rules.len());
    for rule in rules {
        rule.validate()?;
        let reusable = old.get(&rule.resource).and_then(|previous| {
            previous
                .iter()
                .find(|c| *c.rule == rule && !checks.iter().any(|n| Arc::ptr_eq(n, *c)))
        });
        let check = match reusable {
            Some(same) => Arc::clone(same),
            None => Arc::new(ParamFlowCheck {
                rule: Arc::new(rule),
                metric: Arc::new(ParameterMetric::default()),
            }),
        };
        checks.push(check);
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_items_override_the_threshold() {
        let (time, _mock) = TimeSource::frozen();
        let manager = ParamFlowRuleManager::new();
        manager
            .load_rules(vec![
                ParamFlowRule::new("lookup", 0, FlowGrade::Qps, 1.0).with_item("vip", 3.0),
            ])
            .unwrap();
        let check = &manager.checks("lookup")[0];

        let vip = ParamValue::from("vip");
        let guest = ParamValue::from("guest");
        assert_eq!((0..5).filter(|_| check.pass(&time, &vip, 1, None)).count(), 3);
        assert_eq!((0..5).filter(|_| check.pass(&time, &guest, 1, None)).count(), 1);
    }

    #[test]
    fn thread_grade_reads_in_flight_calls() {
        let (time, _mock) = TimeSource::frozen();
        let manager = ParamFlowRuleManager::new();
        manager
            .load_rules(vec![ParamFlowRule::new("lookup", 0, FlowGrade::Thread, 1.0)])
            .unwrap();
        let check = &manager.checks("lookup")[0];
        let key = ParamValue::Int(9);

        assert!(check.pass(&time, &key, 1, None));
        check.metric.increase_thread(&key);
        assert!(!check.pass(&time, &key, 1, None));
        check.metric.decrease_thread(&key);
        assert!(check.pass(&time, &key, 1, None));
    }

    #[test]
    fn reload_keeps_state_of_unchanged_rules() {
        let manager = ParamFlowRuleManager::new();
        let rule = ParamFlowRule::new("a", 0, FlowGrade::Qps, 1.0);
        manager.load_rules(vec![rule.clone()]).unwrap();
        let before = Arc::clone(&manager.checks("a")[0].metric);

        let outcome = manager
            .load_rules(vec![rule, ParamFlowRule::new("b", 1, FlowGrade::Qps, 2.0)])
            .unwrap();
        assert_eq!(outcome, LoadOutcome { previous: 1, current: 2 });
        assert!(Arc::ptr_eq(&before, &manager.checks("a")[0].metric));
    }
}

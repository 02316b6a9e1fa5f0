use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::ControlBehavior;
use super::DefaultController;
use super::FlowGrade;
use super::FlowRule;
use super::LeakyBucketController;
use super::ThrottlingController;
use super::TrafficShapingController;
use super::WarmUpController;
use super::WarmUpThrottlingController;
use crate::error::ConfigError;
use crate::provider::ProviderRegistry;
use crate::rule::LoadOutcome;
use crate::rule::RuleMap;
use crate::rule::group_by_resource;

/// A loaded rule together with the controller enforcing it.
#[derive(Debug)]
pub struct FlowCheck {
    pub rule: Arc<FlowRule>,
    pub controller: Arc<dyn TrafficShapingController>,
}

/// Holds the active flow rules and their controllers.
#[derive(Debug)]
pub struct FlowRuleManager {
    checks: RuleMap<FlowCheck>,
    cold_factor: u32,
    providers: Arc<ProviderRegistry>,
}

impl FlowRuleManager {
    pub fn new(cold_factor: u32, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            checks: RuleMap::default(),
            cold_factor,
            providers,
        }
    }

    /// Replaces every flow rule.
    ///
    /// Unchanged rules keep their controller (and its state). A warm-up
    /// controller built for a changed rule inherits the token stock of the
    /// resource's previous controller of the same behavior.
    ///
    /// # Errors
    ///
    /// Nothing is installed if any rule is invalid.
    pub fn load_rules(&self, rules: Vec<FlowRule>) -> Result<LoadOutcome, ConfigError> {
        let old = self.checks.snapshot();
        let checks = self.build_checks(rules, &old)?;
        let current = checks.len();
        let previous = self
            .checks
            .replace_all(group_by_resource(checks, |c| &c.rule.resource))
            .values()
            .map(Vec::len)
            .sum();
        info!(previous, current, "flow rules loaded");
        Ok(LoadOutcome { previous, current })
    }

    /// Replaces the flow rules of one resource.
    pub fn load_rules_of_resource(
        &self,
        resource: &str,
        rules: Vec<FlowRule>,
    ) -> Result<LoadOutcome, ConfigError> {
        if let Some(stray) = rules.iter().find(|r| r.resource != resource) {
            return Err(ConfigError::rule(
                &stray.resource,
                format!("rule does not belong to `{resource}`"),
            ));
        }
        let old = self.checks.snapshot();
        let checks = self.build_checks(rules, &old)?;
        let current = checks.len();
        let previous = self.checks.replace_resource(resource, checks);
        info!(resource, previous, current, "flow rules of resource loaded");
        Ok(LoadOutcome { previous, current })
    }

    fn build_checks(
        &self,
        rules: Vec<FlowRule>,
        old: &HashMap<String, Vec<Arc<FlowCheck>>>,
    ) -> Result<Vec<Arc<FlowCheck>>, ConfigError> {
        let mut checks: Vec<Arc<FlowCheck>> = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let previous = old.get(&rule.resource).map(Vec::as_slice).unwrap_or_default();

            let reusable = previous
                .iter()
                .find(|c| *c.rule == rule && !checks.iter().any(|n| Arc::ptr_eq(n, *c)));
            if let Some(same) = reusable {
                checks.push(Arc::clone(same));
                continue;
            }

            let controller = self.build_controller(&rule)?;
            if let Some(state) = previous
                .iter()
                .filter(|c| c.rule.control_behavior == rule.control_behavior)
                .find_map(|c| c.controller.warm_up_state())
            {
                controller.restore_warm_up(state);
            }
            checks.push(Arc::new(FlowCheck {
                rule: Arc::new(rule),
                controller,
            }));
        }
        Ok(checks)
    }

    fn build_controller(&self, rule: &FlowRule) -> Result<Arc<dyn TrafficShapingController>, ConfigError> {
        // Only QPS rules are shaped; concurrency is a plain threshold.
        if rule.grade == FlowGrade::Thread {
            return Ok(Arc::new(DefaultController::new(rule.grade, rule.count)));
        }
        let cold_factor = rule.cold_factor.unwrap_or(self.cold_factor);
        let controller: Arc<dyn TrafficShapingController> = match &rule.control_behavior {
            ControlBehavior::Reject => Arc::new(DefaultController::new(rule.grade, rule.count)),
            ControlBehavior::WarmUp => Arc::new(WarmUpController::new(
                rule.count,
                rule.warm_up_period_sec,
                cold_factor,
            )),
            ControlBehavior::Throttling => Arc::new(ThrottlingController::new(
                rule.count,
                rule.stat_interval_ms,
                rule.max_queueing_time_ms,
            )),
            ControlBehavior::WarmUpThrottling => Arc::new(WarmUpThrottlingController::new(
                rule.count,
                rule.warm_up_period_sec,
                cold_factor,
                rule.max_queueing_time_ms,
            )),
            ControlBehavior::LeakyBucket => Arc::new(LeakyBucketController::new(
                rule.count,
                rule.stat_interval_ms,
                rule.max_queueing_time_ms,
            )),
            ControlBehavior::Custom(alias) => {
                let factory = self
                    .providers
                    .controller(alias)
                    .ok_or_else(|| ConfigError::UnknownController(alias.clone()))?;
                factory(rule)
            }
        };
        Ok(controller)
    }

    pub fn rules(&self) -> Vec<FlowRule> {
        let snapshot = self.checks.snapshot();
        let mut resources: Vec<_> = snapshot.keys().collect();
        resources.sort();
        resources
            .into_iter()
            .flat_map(|r| snapshot[r].iter().map(|c| FlowRule::clone(&c.rule)))
            .collect()
    }

    pub fn rules_of(&self, resource: &str) -> Vec<Arc<FlowRule>> {
        self.checks
            .get(resource)
            .iter()
            .map(|c| Arc::clone(&c.rule))
            .collect()
    }

    pub fn checks(&self, resource: &str) -> Vec<Arc<FlowCheck>> {
        self.checks.get(resource)
    }

    pub fn has_rules(&self, resource: &str) -> bool {
        !self.checks.get(resource).is_empty()
    }

    pub fn count(&self) -> usize {
        self.checks.count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::CancelToken;
    use crate::clock::TimeSource;
    use crate::flow::Admission;
    use crate::node::StatConfig;
    use crate::node::StatisticNode;

    fn manager() -> FlowRuleManager {
        FlowRuleManager::new(3, Arc::new(ProviderRegistry::default()))
    }

    #[test]
    fn load_replaces_everything() {
        let manager = manager();
        let outcome = manager
            .load_rules(vec![
                FlowRule::new("a", FlowGrade::Qps, 1.0),
                FlowRule::new("a", FlowGrade::Thread, 2.0),
                FlowRule::new("b", FlowGrade::Qps, 3.0),
            ])
            .unwrap();
        assert_eq!(outcome, LoadOutcome { previous: 0, current: 3 });
        assert_eq!(manager.rules_of("a").len(), 2);

        let outcome = manager
            .load_rules(vec![FlowRule::new("c", FlowGrade::Qps, 1.0)])
            .unwrap();
        assert_eq!(outcome, LoadOutcome { previous: 3, current: 1 });
        assert!(!manager.has_rules("a"));
    }

    #[test]
    fn invalid_load_keeps_previous_rules() {
        let manager = manager();
        manager
            .load_rules(vec![FlowRule::new("a", FlowGrade::Qps, 1.0)])
            .unwrap();
        let err = manager
            .load_rules(vec![
                FlowRule::new("b", FlowGrade::Qps, 1.0),
                FlowRule::new("c", FlowGrade::Qps, -5.0),
            ])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { .. }));
        assert!(manager.has_rules("a"));
        assert!(!manager.has_rules("b"));
    }

    #[test]
    fn per_resource_load() {
        let manager = manager();
        manager
            .load_rules(vec![
                FlowRule::new("a", FlowGrade::Qps, 1.0),
                FlowRule::new("b", FlowGrade::Qps, 1.0),
            ])
            .unwrap();
        let outcome = manager
            .load_rules_of_resource("a", vec![FlowRule::new("a", FlowGrade::Qps, 7.0)])
            .unwrap();
        assert_eq!(outcome, LoadOutcome { previous: 1, current: 1 });
        assert_eq!(manager.rules_of("a")[0].count, 7.0);
        assert!(manager.has_rules("b"));

        assert!(
            manager
                .load_rules_of_resource("a", vec![FlowRule::new("b", FlowGrade::Qps, 1.0)])
                .is_err()
        );
    }

    #[test]
    fn unchanged_rules_keep_their_controller() {
        let manager = manager();
        let rule = FlowRule::new("a", FlowGrade::Qps, 10.0)
            .with_control_behavior(ControlBehavior::Throttling);
        manager.load_rules(vec![rule.clone()]).unwrap();
        let before = Arc::clone(&manager.checks("a")[0].controller);

        manager
            .load_rules(vec![rule, FlowRule::new("b", FlowGrade::Qps, 1.0)])
            .unwrap();
        assert!(Arc::ptr_eq(&before, &manager.checks("a")[0].controller));
    }

    #[test]
    fn warm_up_stock_is_carried_across_reload() {
        let (time, mock) = TimeSource::frozen();
        let node = StatisticNode::new(&StatConfig::default(), time).unwrap();
        let manager = manager();
        let rule = FlowRule::new("a", FlowGrade::Qps, 10.0)
            .with_control_behavior(ControlBehavior::WarmUp)
            .with_warm_up(10, Some(3));
        manager.load_rules(vec![rule.clone()]).unwrap();

        for _ in 0..20 {
            let controller = Arc::clone(&manager.checks("a")[0].controller);
            for _ in 0..20 {
                if controller.can_pass(&node, 1, false, None).is_pass() {
                    node.add_pass_request(1);
                }
            }
            mock.increment(Duration::from_secs(1));
        }
        let warm = manager.checks("a")[0].controller.warm_up_state().unwrap();

        // A changed threshold builds a new controller that starts warm.
        let mut changed = rule;
        changed.count = 12.0;
        manager.load_rules(vec![changed]).unwrap();
        let state = manager.checks("a")[0].controller.warm_up_state().unwrap();
        assert_eq!(state, warm);
    }

    #[test]
    fn custom_controllers_resolve_by_alias() {
        #[derive(Debug)]
        struct Never;
        impl TrafficShapingController for Never {
            fn can_pass(
                &self,
                _node: &StatisticNode,
                _acquire: u32,
                _prioritized: bool,
                _cancel: Option<&CancelToken>,
            ) -> Admission {
                Admission::Reject
            }
        }

        let mut providers = ProviderRegistry::default();
        providers.register_controller("never", Arc::new(|_rule: &FlowRule| {
            Arc::new(Never) as Arc<dyn TrafficShapingController>
        }));
        let manager = FlowRuleManager::new(3, Arc::new(providers));

        let rule = FlowRule::new("a", FlowGrade::Qps, 100.0)
            .with_control_behavior(ControlBehavior::Custom("never".into()));
        manager.load_rules(vec![rule]).unwrap();

        let (time, _mock) = TimeSource::mock();
        let node = StatisticNode::new(&StatConfig::default(), time).unwrap();
        assert_eq!(
            manager.checks("a")[0].controller.can_pass(&node, 1, false, None),
            Admission::Reject
        );

        let unknown = FlowRule::new("a", FlowGrade::Qps, 1.0)
            .with_control_behavior(ControlBehavior::Custom("missing".into()));
        assert_eq!(
            manager.load_rules(vec![unknown]).unwrap_err(),
            ConfigError::UnknownController("missing".into())
        );
    }
}

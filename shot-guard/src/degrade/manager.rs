use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::BreakerStrategy;
use super::DegradeRule;
use super::breaker::CircuitBreaker;
use super::exception::ErrorBreaker;
use super::listener::BreakerListeners;
use super::slow_request::SlowRequestBreaker;
use crate::clock::TimeSource;
use crate::error::ConfigError;
use crate::param::ParamValue;
use crate::rule::LoadOutcome;
use crate::rule::RuleMap;
use crate::rule::group_by_resource;

/// Builds the breaker matching the rule's strategy.
pub(crate) fn new_breaker(
    rule: Arc<DegradeRule>,
    param: Option<ParamValue>,
    time: TimeSource,
    listeners: Arc<BreakerListeners>,
) -> Result<Arc<dyn CircuitBreaker>, ConfigError> {
    let breaker: Arc<dyn CircuitBreaker> = match rule.strategy {
        BreakerStrategy::SlowRequestRatio { .. } => {
            Arc::new(SlowRequestBreaker::new(rule, param, time, listeners)?)
        }
        BreakerStrategy::ErrorRatio { .. } | BreakerStrategy::ErrorCount { .. } => {
            Arc::new(ErrorBreaker::new(rule, param, time, listeners)?)
        }
    };
    Ok(breaker)
}

/// Holds the active degrade rules as circuit breakers.
#[derive(Debug)]
pub struct DegradeRuleManager {
    breakers: RuleMap<dyn CircuitBreaker>,
    time: TimeSource,
    listeners: Arc<BreakerListeners>,
}

impl DegradeRuleManager {
    pub fn new(time: TimeSource, listeners: Arc<BreakerListeners>) -> Self {
        Self {
            breakers: RuleMap::default(),
            time,
            listeners,
        }
    }

    pub fn listeners(&self) -> &Arc<BreakerListeners> {
        &self.listeners
    }

    /// Replaces every degrade rule. A breaker whose rule is unchanged keeps
    /// its state and window.
    pub fn load_rules(&self, rules: Vec<DegradeRule>) -> Result<LoadOutcome, ConfigError> {
        let old = self.breakers.snapshot();
        let breakers = self.build_breakers(rules, &old)?;
        let current = breakers.len();
        let previous = self
            .breakers
            .replace_all(group_by_resource(breakers, |b| &b.rule().resource))
            .values()
            .map(Vec::len)
            .sum();
        info!(previous, current, "degrade rules loaded");
        Ok(LoadOutcome { previous, current })
    }

    pub fn load_rules_of_resource(
        &self,
        resource: &str,
        rules: Vec<DegradeRule>,
    ) -> Result<LoadOutcome, ConfigError> {
        if let Some(stray) = rules.iter().find(|r| r.resource != resource) {
            return Err(ConfigError::rule(
                &stray.resource,
                format!("rule does not belong to `{resource}`"),
            ));
        }
        let old = self.breakers.snapshot();
        let breakers = self.build_breakers(rules, &old)?;
        let current = breakers.len();
        let previous = self.breakers.replace_resource(resource, breakers);
        info!(resource, previous, current, "degrade rules of resource loaded");
        Ok(LoadOutcome { previous, current })
    }

    fn build_breakers(
        &self,
        rules: Vec<DegradeRule>,
        old: &HashMap<String, Vec<Arc<dyn CircuitBreaker>>>,
    ) -> Result<Vec<Arc<dyn CircuitBreaker>>, ConfigError> {
        let mut breakers: Vec<Arc<dyn CircuitBreaker>> = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let reusable = old.get(&rule.resource).and_then(|previous| {
                previous
                    .iter()
                    .find(|b| **b.rule() == rule && !breakers.iter().any(|n| Arc::ptr_eq(n, *b)))
            });
            let breaker = match reusable {
                Some(same) => Arc::clone(same),
                None => new_breaker(
                    Arc::new(rule),
                    None,
                    self.time.clone(),
                    Arc::clone(&self.listeners),
                )?,
            };
            breakers.push(breaker);
        }
        Ok(breakers)
    }

    pub fn breakers(&self, resource: &str) -> Vec<Arc<dyn CircuitBreaker>> {
        self.breakers.get(resource)
    }

    pub fn rules(&self) -> Vec<DegradeRule> {
        let snapshot = self.breakers.snapshot();
        let mut resources: Vec<_> = snapshot.keys().collect();
        resources.sort();
        resources
            .into_iter()
            .flat_map(|r| snapshot[r].iter().map(|b| DegradeRule::clone(b.rule())))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.breakers.count()
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::ParamValue;
use crate::clock::TimeSource;
use crate::degrade::BreakerListeners;
use crate::degrade::BreakerPermit;
use crate::degrade::CircuitBreaker;
use crate::degrade::DegradeRule;
use crate::degrade::new_breaker;
use crate::error::BlockError;
use crate::error::ConfigError;
use crate::error::SlotError;
use crate::rule::LoadOutcome;
use crate::rule::RuleMap;
use crate::rule::group_by_resource;
use crate::slot::PARAM_DEGRADE_ORDER;
use crate::slot::Slot;
use crate::slot::SlotContext;

/// A circuit breaking rule applied per argument value.
///
/// Every value in `tracked_values` gets a breaker of its own; all other
/// values share one more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDegradeRule {
    #[serde(flatten)]
    pub rule: DegradeRule,
    /// Position of the argument; negative counts from the end.
    #[serde(default)]
    pub param_idx: isize,
    #[serde(default)]
    pub tracked_values: Vec<ParamValue>,
}

impl ParamDegradeRule {
    pub fn new(rule: DegradeRule, param_idx: isize) -> Self {
        Self {
            rule,
            param_idx,
            tracked_values: Vec::new(),
        }
    }

    pub fn with_tracked_value(mut self, value: impl Into<ParamValue>) -> Self {
        self.tracked_values.push(value.into());
        self
    }

    pub fn resource(&self) -> &str {
        &self.rule.resource
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rule.validate()
    }
}

/// The breakers of one parameter degrade rule.
#[derive(Debug)]
pub struct ParamBreakers {
    pub rule: Arc<ParamDegradeRule>,
    tracked: HashMap<ParamValue, Arc<dyn CircuitBreaker>>,
    others: Arc<dyn CircuitBreaker>,
}

impl ParamBreakers {
    fn new(
        rule: ParamDegradeRule,
        time: &TimeSource,
        listeners: &Arc<BreakerListeners>,
    ) -> Result<Self, ConfigError> {
        let shared = Arc::new(rule.rule.clone());
        let mut tracked = HashMap::with_capacity(rule.tracked_values.len());
        for value in &rule.tracked_values {
            let breaker = new_breaker(
                Arc::clone(&shared),
                Some(value.clone()),
                time.clone(),
                Arc::clone(listeners),
            )?;
            tracked.insert(value.clone(), breaker);
        }
        let others = new_breaker(shared, None, time.clone(), Arc::clone(listeners))?;
        Ok(Self {
            rule: Arc::new(rule),
            tracked,
            others,
        })
    }

    pub fn breaker_for(&self, value: &ParamValue) -> &Arc<dyn CircuitBreaker> {
        self.tracked.get(value).unwrap_or(&self.others)
    }
}

/// Holds the active parameter degrade rules.
#[derive(Debug)]
pub struct ParamDegradeRuleManager {
    sets: RuleMap<ParamBreakers>,
    time: TimeSource,
    listeners: Arc<BreakerListeners>,
}

impl ParamDegradeRuleManager {
    pub fn new(time: TimeSource, listeners: Arc<BreakerListeners>) -> Self {
        Self {
            sets: RuleMap::default(),
            time,
            listeners,
        }
    }

    pub fn load_rules(&self, rules: Vec<ParamDegradeRule>) -> Result<LoadOutcome, ConfigError> {
        let old = self.sets.snapshot();
        let sets = self.build(rules, &old)?;
        let current = sets.len();
        let previous = self
            .sets
            .replace_all(group_by_resource(sets, |s| s.rule.resource()))
            .values()
            .map(Vec::len)
            .sum();
        info!(previous, current, "parameter degrade rules loaded");
        Ok(LoadOutcome { previous, current })
    }

    pub fn load_rules_of_resource(
        &self,
        resource: &str,
        rules: Vec<ParamDegradeRule>,
    ) -> Result<LoadOutcome, ConfigError> {
        if let Some(stray) = rules.iter().find(|r| r.resource() != resource) {
            return Err(ConfigError::rule(
                stray.resource(),
                format!("rule does not belong to `{resource}`"),
            ));
        }
        let old = self.sets.snapshot();
        let sets = self.build(rules, &old)?;
        let current = sets.len();
        let previous = self.sets.replace_resource(resource, sets);
        info!(resource, previous, current, "parameter degrade rules of resource loaded");
        Ok(LoadOutcome { previous, current })
    }

    fn build(
        &self,
        rules: Vec<ParamDegradeRule>,
        old: &HashMap<String, Vec<Arc<ParamBreakers>>>,
    ) -> Result<Vec<Arc<ParamBreakers>>, ConfigError> {
        let mut sets: Vec<Arc<ParamBreakers>> = Vec::with_capacity(rules.len());
        for rule in rules {
            rule.validate()?;
            let reusable = old.get(rule.resource()).and_then(|previous| {
                previous
                    .iter()
                    .find(|s| *s.rule == rule && !sets.iter().any(|n| Arc::ptr_eq(n, *s)))
            });
            let set = match reusable {
                Some(same) => Arc::clone(same),
                None => Arc::new(ParamBreakers::new(rule, &self.time, &self.listeners)?),
            };
            sets.push(set);
        }
        Ok(sets)
    }

    pub fn breakers(&self, resource: &str) -> Vec<Arc<ParamBreakers>> {
        self.sets.get(resource)
    }

    pub fn rules(&self) -> Vec<ParamDegradeRule> {
        let snapshot = self.sets.snapshot();
        let mut resources: Vec<_> = snapshot.keys().collect();
        resources.sort();
        resources
            .into_iter()
            .flat_map(|r| snapshot[r].iter().map(|s| ParamDegradeRule::clone(&s.rule)))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sets.count()
    }
}

/// Circuit breaking keyed by argument value.
#[derive(Debug, Default)]
pub struct ParamDegradeSlot;

impl Slot for ParamDegradeSlot {
    fn name(&self) -> &str {
        "param-degrade"
    }

    fn order(&self) -> i32 {
        PARAM_DEGRADE_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let sets = ctx.core.param_degrade.breakers(ctx.resource().name());
        for set in sets {
            let Some(value) = ctx.arg(set.rule.param_idx).cloned() else {
                continue;
            };
            let breaker = Arc::clone(set.breaker_for(&value));
            match breaker.try_pass() {
                BreakerPermit::Pass => ctx.param_breakers.push(breaker),
                BreakerPermit::Probe => {
                    ctx.probes.push(Arc::clone(&breaker));
                    ctx.param_breakers.push(breaker);
                }
                BreakerPermit::Deny => {
                    return Err(BlockError::Degrade {
                        resource: ctx.resource().name.clone(),
                        rule: Arc::clone(breaker.rule()),
                        state: breaker.state(),
                        param: Some(value),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn on_block(&self, ctx: &mut SlotContext) {
        ctx.revert_probes();
        ctx.param_breakers.clear();
    }

    fn exit(&self, ctx: &mut SlotContext) {
        if ctx.block_error().is_some() {
            return;
        }
        let breakers = std::mem::take(&mut ctx.param_breakers);
        let ctx: &SlotContext = ctx;
        let overloaded = || {
            ctx.core
                .scenario
                .is_overloaded(ctx.resource().name(), ctx.cluster_node().map(Arc::as_ref))
        };
        for breaker in breakers {
            breaker.on_request_complete(ctx.rt(), ctx.error().is_some(), &overloaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degrade::BreakerStrategy;
    use crate::degrade::State;

    fn manager() -> ParamDegradeRuleManager {
        let (time, _mock) = TimeSource::frozen();
        ParamDegradeRuleManager::new(time, Arc::new(BreakerListeners::default()))
    }

    fn rule() -> ParamDegradeRule {
        ParamDegradeRule::new(
            DegradeRule::new("lookup", BreakerStrategy::ErrorCount { threshold: 2.0 })
                .with_min_request_amount(2),
            0,
        )
        .with_tracked_value("vip")
    }

    #[test]
    fn tracked_values_trip_independently() {
        let manager = manager();
        manager.load_rules(vec![rule()]).unwrap();
        let set = &manager.breakers("lookup")[0];

        let vip = set.breaker_for(&"vip".into());
        vip.on_request_complete(1, true, &|| false);
        vip.on_request_complete(1, true, &|| false);
        assert_eq!(vip.state(), State::Open);

        let guest = set.breaker_for(&"guest".into());
        assert_eq!(guest.state(), State::Closed);
        // Every untracked value shares the same breaker.
        assert!(Arc::ptr_eq(guest, set.breaker_for(&ParamValue::Int(3))));
    }

    #[test]
    fn json_flattens_the_breaker_rule() {
        let rule: ParamDegradeRule = serde_json::from_str(
            r#"{
                "resource": "lookup",
                "strategy": { "kind": "error_count", "threshold": 2 },
                "min_request_amount": 2,
                "param_idx": 0,
                "tracked_values": ["vip"]
            }"#,
        )
        .unwrap();
        assert_eq!(rule, self::rule());
    }

    #[test]
    fn invalid_rules_are_refused() {
        let manager = manager();
        let mut bad = rule();
        bad.rule.recovery_timeout_ms = 0;
        assert!(manager.load_rules(vec![bad]).is_err());
        assert_eq!(manager.count(), 0);
    }
}

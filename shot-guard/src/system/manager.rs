use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::SystemRule;
use crate::error::ConfigError;
use crate::rule::LoadOutcome;

#[derive(Debug, Default)]
struct Loaded {
    rules: Vec<SystemRule>,
    merged: Option<Arc<SystemRule>>,
}

/// Holds the system rules and their strictest combination.
#[derive(Debug, Default)]
pub struct SystemRuleManager {
    loaded: RwLock<Arc<Loaded>>,
}

impl SystemRuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_rules(&self, rules: Vec<SystemRule>) -> Result<LoadOutcome, ConfigError> {
        for rule in &rules {
            rule.validate()?;
        }
        let merged = rules
            .iter()
            .skip(1)
            .fold(rules.first().cloned(), |acc, rule| acc.map(|acc| acc.merge(rule)))
            .map(Arc::new);
        let current = rules.len();
        let previous = std::mem::replace(&mut *self.loaded.write(), Arc::new(Loaded { rules, merged }))
            .rules
            .len();
        info!(previous, current, "system rules loaded");
        Ok(LoadOutcome { previous, current })
    }

    /// The thresholds in force, `None` without rules.
    pub fn merged(&self) -> Option<Arc<SystemRule>> {
        self.loaded.read().merged.clone()
    }

    pub fn rules(&self) -> Vec<SystemRule> {
        self.loaded.read().rules.clone()
    }

    pub fn count(&self) -> usize {
        self.loaded.read().rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_merges_and_replaces() {
        let manager = SystemRuleManager::new();
        assert!(manager.merged().is_none());

        manager
            .load_rules(vec![
                SystemRule {
                    qps: 10.0,
                    ..Default::default()
                },
                SystemRule {
                    qps: 5.0,
                    max_thread: 3.0,
                    ..Default::default()
                },
            ])
            .unwrap();
        let merged = manager.merged().unwrap();
        assert_eq!(merged.qps, 5.0);
        assert_eq!(merged.max_thread, 3.0);

        let outcome = manager.load_rules(vec![]).unwrap();
        assert_eq!(outcome, LoadOutcome { previous: 2, current: 0 });
        assert!(manager.merged().is_none());
    }
}

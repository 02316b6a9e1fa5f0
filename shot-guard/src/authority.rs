//! Origin-based access control.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::error::BlockError;
use crate::error::ConfigError;
use crate::error::SlotError;
use crate::rule::LoadOutcome;
use crate::rule::RuleMap;
use crate::rule::group_by_resource;
use crate::slot::AUTHORITY_ORDER;
use crate::slot::Slot;
use crate::slot::SlotContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityStrategy {
    /// Only the listed origins may call.
    #[default]
    White,
    /// The listed origins may not call.
    Black,
}

/// Allows or denies callers of a resource by origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityRule {
    pub resource: String,
    pub limit_app: Vec<String>,
    pub strategy: AuthorityStrategy,
}

impl AuthorityRule {
    pub fn white(resource: impl Into<String>, origins: &[&str]) -> Self {
        Self {
            resource: resource.into(),
            limit_app: origins.iter().map(|o| o.to_string()).collect(),
            strategy: AuthorityStrategy::White,
        }
    }

    pub fn black(resource: impl Into<String>, origins: &[&str]) -> Self {
        Self {
            strategy: AuthorityStrategy::Black,
            ..Self::white(resource, origins)
        }
    }

    /// Whether `origin` may call. Calls without an origin always may.
    pub fn permits(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return true;
        }
        let listed = self.limit_app.iter().any(|app| app == origin);
        match self.strategy {
            AuthorityStrategy::White => listed,
            AuthorityStrategy::Black => !listed,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource.trim().is_empty() {
            return Err(ConfigError::rule(&self.resource, "resource must not be empty"));
        }
        if self.limit_app.iter().all(|app| app.trim().is_empty()) {
            return Err(ConfigError::rule(&self.resource, "limit_app must name an origin"));
        }
        Ok(())
    }
}

/// Holds the active authority rules.
#[derive(Debug, Default)]
pub struct AuthorityRuleManager {
    rules: RuleMap<AuthorityRule>,
}

impl AuthorityRuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_rules(&self, rules: Vec<AuthorityRule>) -> Result<LoadOutcome, ConfigError> {
        for rule in &rules {
            rule.validate()?;
        }
        let current = rules.len();
        let rules = rules.into_iter().map(Arc::new).collect();
        let previous = self
            .rules
            .replace_all(group_by_resource(rules, |r| &r.resource))
            .values()
            .map(Vec::len)
            .sum();
        info!(previous, current, "authority rules loaded");
        Ok(LoadOutcome { previous, current })
    }

    pub fn load_rules_of_resource(
        &self,
        resource: &str,
        rules: Vec<AuthorityRule>,
    ) -> Result<LoadOutcome, ConfigError> {
        for rule in &rules {
            rule.validate()?;
            if rule.resource != resource {
                return Err(ConfigError::rule(
                    &rule.resource,
                    format!("rule does not belong to `{resource}`"),
                ));
            }
        }
        let current = rules.len();
        let previous = self
            .rules
            .replace_resource(resource, rules.into_iter().map(Arc::new).collect());
        info!(resource, previous, current, "authority rules of resource loaded");
        Ok(LoadOutcome { previous, current })
    }

    pub fn rules_of(&self, resource: &str) -> Vec<Arc<AuthorityRule>> {
        self.rules.get(resource)
    }

    pub fn rules(&self) -> Vec<AuthorityRule> {
        let snapshot = self.rules.snapshot();
        let mut resources: Vec<_> = snapshot.keys().collect();
        resources.sort();
        resources
            .into_iter()
            .flat_map(|r| snapshot[r].iter().map(|rule| AuthorityRule::clone(rule)))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.rules.count()
    }
}

/// Rejects callers the resource's authority rules do not permit.
#[derive(Debug, Default)]
pub struct AuthoritySlot;

impl Slot for AuthoritySlot {
    fn name(&self) -> &str {
        "authority"
    }

    fn order(&self) -> i32 {
        AUTHORITY_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let origin = ctx.origin();
        if origin.is_empty() {
            return Ok(());
        }
        let rules = ctx.core.authority.rules_of(ctx.resource().name());
        match rules.into_iter().find(|rule| !rule.permits(origin)) {
            Some(rule) => Err(BlockError::Authority {
                resource: ctx.resource().name.clone(),
                origin: origin.to_string(),
                rule,
            }
            .into()),
            None => Ok(()),
        }
    }
}

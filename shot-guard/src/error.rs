use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::authority::AuthorityRule;
use crate::degrade::DegradeRule;
use crate::degrade::State;
use crate::flow::FlowRule;
use crate::param::ParamFlowRule;
use crate::param::ParamValue;
use crate::system::SystemMetric;
use crate::system::SystemRule;

/// Which kind of rule produced a [`BlockError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    FlowRule,
    DegradeRule,
    SystemRule,
    AuthorityRule,
    ParamFlow,
    Custom,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockReason::FlowRule => "flow",
            BlockReason::DegradeRule => "degrade",
            BlockReason::SystemRule => "system",
            BlockReason::AuthorityRule => "authority",
            BlockReason::ParamFlow => "param_flow",
            BlockReason::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// The rejection returned by `EntryBuilder::build` when a rule denies passage.
///
/// Every variant carries the resource and the rule that triggered the block so
/// callers can pick a fallback per cause.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BlockError {
    /// A flow rule's traffic shaping controller refused the call.
    #[error("flow control triggered on `{resource}`")]
    Flow {
        resource: String,
        rule: Arc<FlowRule>,
    },

    /// A circuit breaker is not closed.
    ///
    /// `param` is set when the breaker belongs to a parameter degrade rule.
    #[error("circuit breaker on `{resource}` is {state}")]
    Degrade {
        resource: String,
        rule: Arc<DegradeRule>,
        state: State,
        param: Option<ParamValue>,
    },

    /// Inbound traffic exceeded a system protection threshold.
    #[error("system protection triggered on `{resource}`: {metric} {value} exceeds {threshold}")]
    System {
        resource: String,
        rule: Arc<SystemRule>,
        metric: SystemMetric,
        value: f64,
        threshold: f64,
    },

    /// The caller origin is not allowed.
    #[error("origin `{origin}` is not authorized for `{resource}`")]
    Authority {
        resource: String,
        origin: String,
        rule: Arc<AuthorityRule>,
    },

    /// A hot parameter value exceeded its threshold.
    #[error("hot parameter {value} of `{resource}` is over its limit")]
    ParamFlow {
        resource: String,
        rule: Arc<ParamFlowRule>,
        value: ParamValue,
    },

    /// Raised by a slot registered through the provider registry.
    #[error("`{resource}` blocked by slot `{slot}`: {message}")]
    Custom {
        resource: String,
        slot: String,
        message: String,
    },
}

impl BlockError {
    pub fn reason(&self) -> BlockReason {
        match self {
            BlockError::Flow { .. } => BlockReason::FlowRule,
            BlockError::Degrade { .. } => BlockReason::DegradeRule,
            BlockError::System { .. } => BlockReason::SystemRule,
            BlockError::Authority { .. } => BlockReason::AuthorityRule,
            BlockError::ParamFlow { .. } => BlockReason::ParamFlow,
            BlockError::Custom { .. } => BlockReason::Custom,
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            BlockError::Flow { resource, .. }
            | BlockError::Degrade { resource, .. }
            | BlockError::System { resource, .. }
            | BlockError::Authority { resource, .. }
            | BlockError::ParamFlow { resource, .. }
            | BlockError::Custom { resource, .. } => resource,
        }
    }

    /// True when the block comes from an open (or probing) circuit breaker
    /// rather than from a rate threshold.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BlockError::Degrade { .. })
    }
}

/// Rejected configuration. The previously loaded rule set stays active.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid rule for `{resource}`: {reason}")]
    InvalidRule { resource: String, reason: String },

    #[error("interval {interval_ms}ms cannot be split into {sample_count} windows")]
    InvalidWindow { sample_count: usize, interval_ms: u64 },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("no traffic shaping controller registered as `{0}`")]
    UnknownController(String),

    #[error("malformed payload: {0}")]
    Payload(String),
}

impl ConfigError {
    pub(crate) fn rule(resource: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidRule {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Payload(err.to_string())
    }
}

/// Outcome of a single slot's `entry` stage.
#[derive(Debug, Clone)]
pub enum SlotError {
    /// Stop the chain and reject the call.
    Block(BlockError),
    /// Stop the chain but let the call through; the pass was pre-registered in
    /// a future window and the caller already waited for it.
    PriorityWait(std::time::Duration),
    /// Unexpected failure inside the slot. Logged, then treated as allow.
    Internal(String),
}

impl From<BlockError> for SlotError {
    fn from(err: BlockError) -> Self {
        SlotError::Block(err)
    }
}

impl From<ConfigError> for SlotError {
    fn from(err: ConfigError) -> Self {
        SlotError::Internal(err.to_string())
    }
}

//! Hot-parameter protection: flow limits and circuit breakers keyed by the
//! value of one call argument.

mod degrade;
mod manager;
mod metric;
mod rule;
mod slot;
mod value;

pub use degrade::ParamBreakers;
pub use degrade::ParamDegradeRule;
pub use degrade::ParamDegradeRuleManager;
pub use degrade::ParamDegradeSlot;
pub use manager::ParamFlowCheck;
pub use manager::ParamFlowRuleManager;
pub use metric::MAX_TRACKED_VALUES;
pub use metric::ParameterMetric;
pub use rule::ParamControlBehavior;
pub use rule::ParamFlowItem;
pub use rule::ParamFlowRule;
pub use slot::ParamFlowSlot;
pub use value::ParamValue;

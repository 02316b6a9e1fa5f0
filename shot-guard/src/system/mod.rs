//! Adaptive system protection for inbound traffic.

mod manager;
mod rule;
mod slot;
mod status;

pub use manager::SystemRuleManager;
pub use rule::SystemMetric;
pub use rule::SystemRule;
pub use slot::SystemSlot;
pub use status::SamplerHandle;
pub use status::SystemStatus;

//! Flow control: rate and concurrency thresholds with traffic shaping.
//!
//! A [`FlowRule`] picks the node it reads (the resource, one origin, a
//! related resource or one calling context) and a
//! [`TrafficShapingController`] that decides from that node's figures.

mod controller;
mod leaky_bucket;
mod manager;
mod rule;
mod slot;
mod throttling;
mod warm_up;

pub use controller::Admission;
pub use controller::DefaultController;
pub use controller::TrafficShapingController;
pub use controller::WarmUpState;
pub use leaky_bucket::DRAIN_IDLE_GRACE;
pub use leaky_bucket::LeakyBucketController;
pub use manager::FlowCheck;
pub use manager::FlowRuleManager;
pub use rule::ControlBehavior;
pub use rule::FlowGrade;
pub use rule::FlowRule;
pub use rule::FlowStrategy;
pub use rule::LIMIT_APP_DEFAULT;
pub use rule::LIMIT_APP_OTHER;
pub use slot::FlowSlot;
pub(crate) use slot::Reservation;
pub use throttling::ThrottlingController;
pub(crate) use throttling::Pacer;
pub use warm_up::WarmUpController;
pub use warm_up::WarmUpThrottlingController;

//! Circuit breaking.
//!
//! Each [`DegradeRule`] becomes a [`CircuitBreaker`] with its own window.
//! A breaker is CLOSED while healthy, OPEN (rejecting everything) for the
//! recovery timeout once its strategy trips, then HALF_OPEN while a single
//! probe call decides whether it closes again or reopens.

mod breaker;
mod exception;
mod listener;
mod manager;
mod rule;
mod slot;
mod slow_request;

pub use breaker::BreakerCore;
pub use breaker::BreakerCounts;
pub use breaker::BreakerPermit;
pub use breaker::CircuitBreaker;
pub use breaker::State;
pub use exception::ErrorBreaker;
pub use listener::BreakerListeners;
pub use listener::StateChange;
pub use listener::StateChangeListener;
pub use listener::TracingListener;
pub use manager::DegradeRuleManager;
pub(crate) use manager::new_breaker;
pub use rule::BreakerStrategy;
pub use rule::DegradeRule;
pub use slot::DegradeSlot;
pub use slow_request::SlowRequestBreaker;

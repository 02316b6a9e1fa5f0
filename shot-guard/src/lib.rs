//! # shot-guard
//!
//! `shot-guard` decides, for every call to a named resource, whether the call
//! may proceed, and feeds the outcome back into sliding window statistics.
//!
//! ## How a call is checked
//!
//! Every resource gets a slot chain. An entry runs through the slots in
//! order: nodes are selected, statistics are prepared, then authority,
//! system, hot-parameter, flow and circuit breaker rules each get a say. The
//! first slot that says no turns the call into a [`BlockError`]; an
//! admitted call gets an [`Entry`] that is exited once the work is done.
//!
//! * **Flow control**: QPS and concurrency thresholds with reject, warm-up,
//!   uniform pacing and leaky bucket shaping ([`flow`]).
//! * **Circuit breaking**: slow-request ratio, error ratio and error count
//!   breakers ([`degrade`]), optionally gated by the overload [`scenario`]
//!   detector.
//! * **Hot parameters**: limits and breakers per argument value ([`param`]).
//! * **System and authority**: host-level protection of inbound traffic
//!   ([`system`]) and origin allow/deny lists ([`authority`]).
//!
//! ## Example
//!
//! ```rust
//! use shot_guard::Engine;
//! use shot_guard::flow::FlowGrade;
//! use shot_guard::flow::FlowRule;
//!
//! let engine = Engine::builder().build().unwrap();
//! engine
//!     .flow_rules()
//!     .load_rules(vec![FlowRule::new("orders", FlowGrade::Qps, 1.0)])
//!     .unwrap();
//!
//! let entry = engine.entry("orders").build().unwrap();
//! assert!(engine.entry("orders").build().is_err());
//! entry.exit();
//! ```

pub mod authority;
pub mod clock;
pub mod command;
pub mod config;
mod context;
pub mod degrade;
mod engine;
mod entry;
pub mod error;
pub mod flow;
pub mod node;
pub mod param;
pub mod provider;
pub mod rule;
pub mod scenario;
pub mod slot;
pub mod stat;
pub mod system;

pub use clock::CancelToken;
pub use clock::TimeSource;
pub use config::EngineConfig;
pub use context::Context;
pub use engine::Engine;
pub use engine::EngineBuilder;
pub use engine::EntryBuilder;
pub use entry::Entry;
pub use error::BlockError;
pub use error::BlockReason;
pub use error::ConfigError;
pub use error::SlotError;
pub use node::EntryType;
pub use node::ResourceType;
pub use param::ParamValue;
pub use rule::LoadOutcome;

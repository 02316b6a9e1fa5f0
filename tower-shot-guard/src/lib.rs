//! # Tower Shot Guard
//!
//! `tower-shot-guard` puts a [`shot_guard::Engine`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service. Every request becomes
//! an entry of the engine: it is checked against the flow, circuit breaker,
//! hot-parameter, system and authority rules of its resource, and the
//! outcome of the inner call (latency, success or failure) flows back into
//! the engine's statistics.
//!
//! ```rust,no_run
//! use shot_guard::Engine;
//! use shot_guard::flow::FlowGrade;
//! use shot_guard::flow::FlowRule;
//! use tower::ServiceBuilder;
//! use tower_shot_guard::GuardLayer;
//!
//! let engine = Engine::builder().build().unwrap();
//! engine
//!     .flow_rules()
//!     .load_rules(vec![FlowRule::new("orders", FlowGrade::Qps, 100.0)])
//!     .unwrap();
//!
//! let service = ServiceBuilder::new()
//!     .layer(GuardLayer::<String>::new(engine, "orders"))
//!     .service_fn(|req: String| async move { Ok::<_, std::io::Error>(req) });
//! # drop(service);
//! ```
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GuardError`], mapping blocks to
//!   HTTP status codes (429, 503, 403).

mod error;
mod layer;
mod service;


pub use error::GuardError;
pub use layer::GuardLayer;
pub use service::GuardService;
pub use service::ResponseFuture;

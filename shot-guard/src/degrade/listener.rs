use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use super::DegradeRule;
use super::State;
use crate::param::ParamValue;

/// A circuit breaker transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub rule: Arc<DegradeRule>,
    pub param: Option<ParamValue>,
    pub from: State,
    pub to: State,
    /// The ratio or count that tripped the breaker, when it opened on data.
    pub snapshot: Option<f64>,
    /// Set when the breaker moved to open.
    pub next_retry_ms: Option<u64>,
}

/// Observer of circuit breaker transitions.
///
/// Called on the thread that performed the transition; keep it short.
pub trait StateChangeListener: Send + Sync + fmt::Debug {
    fn on_change(&self, change: &StateChange);
}

/// Logs every transition at `info`.
#[derive(Debug, Default)]
pub struct TracingListener;

impl StateChangeListener for TracingListener {
    fn on_change(&self, change: &StateChange) {
        info!(
            resource = %change.rule.resource,
            param = change.param.as_ref().map(tracing::field::display),
            from = %change.from,
            to = %change.to,
            snapshot = change.snapshot,
            "circuit breaker state changed"
        );
    }
}

/// The listeners every breaker of an engine reports to.
#[derive(Debug)]
pub struct BreakerListeners {
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
}

impl Default for BreakerListeners {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(vec![Arc::new(TracingListener)]),
        }
    }
}

impl BreakerListeners {
    pub fn add(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub(crate) fn notify(&self, change: &StateChange) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_change(change);
        }
    }
}

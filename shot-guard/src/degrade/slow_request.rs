use std::sync::Arc;

use super::BreakerStrategy;
use super::DegradeRule;
use super::breaker::BreakerCore;
use super::breaker::BreakerCounts;
use super::breaker::BreakerWindow;
use super::breaker::CircuitBreaker;
use super::breaker::complete;
use super::listener::BreakerListeners;
use crate::clock::TimeSource;
use crate::error::ConfigError;
use crate::param::ParamValue;

/// Opens when the share of calls slower than the allowed response time
/// reaches the threshold.
#[derive(Debug)]
pub struct SlowRequestBreaker {
    core: BreakerCore,
    window: BreakerWindow,
    max_allowed_rt_ms: u64,
    threshold: f64,
}

impl SlowRequestBreaker {
    pub(crate) fn new(
        rule: Arc<DegradeRule>,
        param: Option<ParamValue>,
        time: TimeSource,
        listeners: Arc<BreakerListeners>,
    ) -> Result<Self, ConfigError> {
        let BreakerStrategy::SlowRequestRatio {
            max_allowed_rt_ms,
            threshold,
        } = rule.strategy
        else {
            return Err(ConfigError::rule(&rule.resource, "not a slow request rule"));
        };
        Ok(Self {
            window: BreakerWindow::new(rule.stat_interval_ms)?,
            core: BreakerCore::new(rule, param, time, listeners),
            max_allowed_rt_ms,
            threshold,
        })
    }
}

impl CircuitBreaker for SlowRequestBreaker {
    fn core(&self) -> &BreakerCore {
        &self.core
    }

    fn on_request_complete(&self, rt: u64, _failed: bool, overloaded: &dyn Fn() -> bool) {
        let slow = rt > self.max_allowed_rt_ms;
        complete(
            &self.core,
            &self.window,
            slow,
            |counts| {
                let ratio = counts.target as f64 / counts.total as f64;
                (ratio >= self.threshold).then_some(ratio)
            },
            overloaded,
        );
    }

    fn counts(&self) -> BreakerCounts {
        self.window.counts(self.core.now())
    }
}

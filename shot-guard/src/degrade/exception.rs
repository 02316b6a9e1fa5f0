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

#[derive(Debug, Clone, Copy)]
enum ErrorMeasure {
    Ratio(f64),
    Count(f64),
}

/// Opens on failed calls, either by ratio or by absolute count.
#[derive(Debug)]
pub struct ErrorBreaker {
    core: BreakerCore,
    window: BreakerWindow,
    measure: ErrorMeasure,
}

impl ErrorBreaker {
    pub(crate) fn new(
        rule: Arc<DegradeRule>,
        param: Option<ParamValue>,
        time: TimeSource,
        listeners: Arc<BreakerListeners>,
    ) -> Result<Self, ConfigError> {
        let measure = match rule.strategy {
            BreakerStrategy::ErrorRatio { threshold } => ErrorMeasure::Ratio(threshold),
            BreakerStrategy::ErrorCount { threshold } => ErrorMeasure::Count(threshold),
            BreakerStrategy::SlowRequestRatio { .. } => {
                return Err(ConfigError::rule(&rule.resource, "not an error rule"));
            }
        };
        Ok(Self {
            window: BreakerWindow::new(rule.stat_interval_ms)?,
            core: BreakerCore::new(rule, param, time, listeners),
            measure,
        })
    }
}

impl CircuitBreaker for ErrorBreaker {
    fn core(&self) -> &BreakerCore {
        &self.core
    }

    fn on_request_complete(&self, _rt: u64, failed: bool, overloaded: &dyn Fn() -> bool) {
        complete(
            &self.core,
            &self.window,
            failed,
            |counts| match self.measure {
                ErrorMeasure::Ratio(threshold) => {
                    let ratio = counts.target as f64 / counts.total as f64;
                    (ratio >= threshold).then_some(ratio)
                }
                ErrorMeasure::Count(threshold) => {
                    let errors = counts.target as f64;
                    (errors >= threshold).then_some(errors)
                }
            },
            overloaded,
        );
    }

    fn counts(&self) -> BreakerCounts {
        self.window.counts(self.core.now())
    }
}

//! Adaptive overload detection.
//!
//! A resource is in an overload scenario when its current second looks
//! anomalous against its own recent history *and* the host is under
//! pressure. Breakers built from rules with `scenario_check` only trip
//! while this holds.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::error::ConfigError;
use crate::node::ClusterNode;
use crate::stat::MetricSnapshot;
use crate::system::SystemStatus;

/// Fewest history buckets with traffic that allow a verdict.
pub const MIN_HISTORY_WINDOWS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Preceding one-second buckets the current one is compared with.
    pub history_windows: usize,
    /// Ratio against the history average that counts as anomalous growth.
    pub growth_multiple: f64,
    pub cpu_threshold: f64,
    pub thread_pool_threshold: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            history_windows: 5,
            growth_multiple: 2.0,
            cpu_threshold: 0.8,
            thread_pool_threshold: 0.8,
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_windows < MIN_HISTORY_WINDOWS {
            return Err(ConfigError::InvalidConfig(format!(
                "history_windows must be at least {MIN_HISTORY_WINDOWS}"
            )));
        }
        if self.growth_multiple.is_nan() || self.growth_multiple <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "growth_multiple must be positive".into(),
            ));
        }
        for (name, value) in [
            ("cpu_threshold", self.cpu_threshold),
            ("thread_pool_threshold", self.thread_pool_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Per-resource overload verdicts.
#[derive(Debug)]
pub struct ScenarioDetector {
    status: Arc<SystemStatus>,
    default: RwLock<Arc<ScenarioConfig>>,
    resources: RwLock<Arc<HashMap<String, Arc<ScenarioConfig>>>>,
}

impl ScenarioDetector {
    pub fn new(status: Arc<SystemStatus>) -> Self {
        Self {
            status,
            default: RwLock::new(Arc::new(ScenarioConfig::default())),
            resources: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn set_default(&self, config: ScenarioConfig) -> Result<(), ConfigError> {
        config.validate()?;
        info!(?config, "default scenario config replaced");
        *self.default.write() = Arc::new(config);
        Ok(())
    }

    pub fn set_config(&self, resource: &str, config: ScenarioConfig) -> Result<(), ConfigError> {
        config.validate()?;
        info!(resource, ?config, "scenario config replaced");
        let mut resources = self.resources.write();
        let mut next = HashMap::clone(&resources);
        next.insert(resource.to_string(), Arc::new(config));
        *resources = Arc::new(next);
        Ok(())
    }

    /// Drops the resource's own config so it falls back to the default.
    pub fn remove_config(&self, resource: &str) -> bool {
        let mut resources = self.resources.write();
        if !resources.contains_key(resource) {
            return false;
        }
        let mut next = HashMap::clone(&resources);
        next.remove(resource);
        *resources = Arc::new(next);
        true
    }

    pub fn config_for(&self, resource: &str) -> Arc<ScenarioConfig> {
        let own = self.resources.read().get(resource).map(Arc::clone);
        own.unwrap_or_else(|| Arc::clone(&self.default.read()))
    }

    /// Whether `resource` is overloaded right now. Without a node, or with
    /// too little history, there is no verdict and the answer is false.
    pub fn is_overloaded(&self, resource: &str, node: Option<&ClusterNode>) -> bool {
        let Some(node) = node else {
            return false;
        };
        let config = self.config_for(resource);
        let stat = node.stat();
        let now = stat.time().now_ms();
        let window = stat.minute_window_ms();

        let current = stat.minute_bucket_at(now).unwrap_or_default();
        let history: Vec<MetricSnapshot> = (1..=config.history_windows as u64)
            .filter_map(|i| now.checked_sub(i * window))
            .filter_map(|t| stat.minute_bucket_at(t))
            .filter(|bucket| bucket.total() > 0)
            .collect();
        if history.len() < MIN_HISTORY_WINDOWS {
            return false;
        }

        if !grew(&current, &history, config.growth_multiple) {
            return false;
        }
        let cpu = self.status.cpu_usage();
        let pool = self.status.thread_pool_usage();
        let pressured = (cpu >= 0.0 && cpu >= config.cpu_threshold)
            || (pool >= 0.0 && pool >= config.thread_pool_threshold);
        if pressured {
            debug!(resource, cpu, pool, "overload scenario detected");
        }
        pressured
    }
}

/// True when any of call count, error rate or average RT reached
/// `multiple` times its history average. A zero baseline never counts.
fn grew(current: &MetricSnapshot, history: &[MetricSnapshot], multiple: f64) -> bool {
    let average = |f: fn(&MetricSnapshot) -> f64| {
        history.iter().map(f).sum::<f64>() / history.len() as f64
    };
    let probes: [fn(&MetricSnapshot) -> f64; 3] = [
        |s| s.total() as f64,
        MetricSnapshot::error_rate,
        MetricSnapshot::avg_rt,
    ];
    probes.into_iter().any(|f| {
        let baseline = average(f);
        baseline > 0.0 && f(current) >= baseline * multiple
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::TimeSource;
    use crate::node::ResourceType;
    use crate::node::StatConfig;

    fn setup() -> (ScenarioDetector, Arc<SystemStatus>, ClusterNode, Arc<quanta::Mock>) {
        let status = Arc::new(SystemStatus::new());
        let detector = ScenarioDetector::new(Arc::clone(&status));
        let (time, mock) = TimeSource::mock();
        let node = ClusterNode::new("svc", ResourceType::Common, &StatConfig::default(), time).unwrap();
        (detector, status, node, mock)
    }

    fn traffic(node: &ClusterNode, mock: &quanta::Mock, per_second: &[u32]) {
        for &count in per_second {
            node.stat().add_pass_request(count);
            mock.increment(Duration::from_secs(1));
        }
    }

    #[test]
    fn needs_growth_and_pressure() {
        let (detector, status, node, mock) = setup();
        traffic(&node, &mock, &[10, 10, 10, 10, 10]);
        node.stat().add_pass_request(30);

        // Unknown gauges never count.
        assert!(!detector.is_overloaded("svc", Some(&node)));
        status.set_cpu_usage(0.5);
        assert!(!detector.is_overloaded("svc", Some(&node)));
        status.set_cpu_usage(0.9);
        assert!(detector.is_overloaded("svc", Some(&node)));
    }

    #[test]
    fn steady_traffic_is_not_a_scenario() {
        let (detector, status, node, mock) = setup();
        status.set_thread_pool_usage(1.0);
        traffic(&node, &mock, &[10, 10, 10, 10, 10]);
        node.stat().add_pass_request(12);
        assert!(!detector.is_overloaded("svc", Some(&node)));
    }

    #[test]
    fn too_little_history_gives_no_verdict() {
        let (detector, status, node, mock) = setup();
        status.set_cpu_usage(1.0);
        traffic(&node, &mock, &[10, 10]);
        node.stat().add_pass_request(100);
        assert!(!detector.is_overloaded("svc", Some(&node)));
        assert!(!detector.is_overloaded("svc", None));
    }

    #[test]
    fn configs_are_resource_scoped() {
        let (detector, status, node, mock) = setup();
        status.set_cpu_usage(0.9);
        traffic(&node, &mock, &[10, 10, 10, 10, 10]);
        node.stat().add_pass_request(30);

        let strict = ScenarioConfig {
            growth_multiple: 5.0,
            ..ScenarioConfig::default()
        };
        detector.set_config("svc", strict.clone()).unwrap();
        assert_eq!(*detector.config_for("svc"), strict);
        assert_eq!(*detector.config_for("other"), ScenarioConfig::default());
        assert!(!detector.is_overloaded("svc", Some(&node)));

        assert!(detector.remove_config("svc"));
        assert!(detector.is_overloaded("svc", Some(&node)));
    }

    #[test]
    fn invalid_configs_are_refused() {
        let (detector, ..) = setup();
        let short = ScenarioConfig {
            history_windows: 2,
            ..ScenarioConfig::default()
        };
        assert!(detector.set_default(short).is_err());
        let wild = ScenarioConfig {
            cpu_threshold: 1.5,
            ..ScenarioConfig::default()
        };
        assert!(detector.set_config("svc", wild).is_err());
    }
}

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

pub const DEFAULT_APP_NAME: &str = "shot-guard";
pub const DEFAULT_MAX_RESOURCE_COUNT: usize = 6000;
pub const DEFAULT_MAX_CONTEXT_COUNT: usize = 2000;
pub const DEFAULT_OCCUPY_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_COLD_FACTOR: u32 = 3;
pub const DEFAULT_STATISTIC_MAX_RT_MS: u64 = 5000;

/// Engine-wide settings.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use shot_guard::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{ "app_name": "orders", "max_resource_count": 100 }"#)
///     .unwrap();
/// assert_eq!(config.second_interval_ms, 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub app_name: String,
    /// Resources beyond this count get no slot chain (and are not checked).
    pub max_resource_count: usize,
    /// Distinct context names beyond this count run unchecked.
    pub max_context_count: usize,
    /// Buckets of the per-second sliding window.
    pub second_sample_count: usize,
    pub second_interval_ms: u64,
    /// Buckets of the per-minute sliding window.
    pub minute_sample_count: usize,
    pub minute_interval_ms: u64,
    /// Longest wait a prioritized call may take to borrow a future window.
    pub occupy_timeout_ms: u64,
    /// Default cold factor of warm-up controllers.
    pub cold_factor: u32,
    /// Response times are clamped to this value before being recorded.
    pub statistic_max_rt_ms: u64,
    /// Refresh period of the CPU/load sampler; disabled when `None`.
    pub system_sample_interval_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            max_resource_count: DEFAULT_MAX_RESOURCE_COUNT,
            max_context_count: DEFAULT_MAX_CONTEXT_COUNT,
            second_sample_count: 2,
            second_interval_ms: 1000,
            minute_sample_count: 60,
            minute_interval_ms: 60_000,
            occupy_timeout_ms: DEFAULT_OCCUPY_TIMEOUT_MS,
            cold_factor: DEFAULT_COLD_FACTOR,
            statistic_max_rt_ms: DEFAULT_STATISTIC_MAX_RT_MS,
            system_sample_interval_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.app_name.trim().is_empty() {
            return invalid("app_name must not be empty");
        }
        if self.max_resource_count == 0 {
            return invalid("max_resource_count must be positive");
        }
        if self.max_context_count == 0 {
            return invalid("max_context_count must be positive");
        }
        check_window(self.second_sample_count, self.second_interval_ms)?;
        check_window(self.minute_sample_count, self.minute_interval_ms)?;
        if self.cold_factor <= 1 {
            return invalid("cold_factor must be greater than 1");
        }
        if self.statistic_max_rt_ms == 0 {
            return invalid("statistic_max_rt_ms must be positive");
        }
        if self.system_sample_interval_ms == Some(0) {
            return invalid("system_sample_interval_ms must be positive");
        }
        Ok(())
    }
}

fn check_window(sample_count: usize, interval_ms: u64) -> Result<(), ConfigError> {
    if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count as u64 != 0 {
        return Err(ConfigError::InvalidWindow {
            sample_count,
            interval_ms,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "occupy_timeout_ms": 250 }"#).unwrap();
        assert_eq!(config.occupy_timeout_ms, 250);
        assert_eq!(config.max_resource_count, DEFAULT_MAX_RESOURCE_COUNT);
    }

    #[test]
    fn rejects_bad_windows() {
        let err = EngineConfig::from_json(r#"{ "second_sample_count": 3 }"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidWindow {
                sample_count: 3,
                interval_ms: 1000
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            EngineConfig::from_json("{ nope"),
            Err(ConfigError::Payload(_))
        ));
        assert!(EngineConfig::from_json(r#"{ "cold_factor": 1 }"#).is_err());
    }
}

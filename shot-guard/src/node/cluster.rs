use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::ResourceType;
use super::StatConfig;
use super::StatisticNode;
use crate::clock::TimeSource;
use crate::error::ConfigError;

/// Process-wide statistics of one resource, across every context.
///
/// Also keeps a per-origin breakdown used by origin-scoped flow rules.
#[derive(Debug)]
pub struct ClusterNode {
    name: String,
    resource_type: ResourceType,
    stat: StatisticNode,
    origins: RwLock<HashMap<String, Arc<StatisticNode>>>,
    config: StatConfig,
}

impl ClusterNode {
    pub fn new(
        name: impl Into<String>,
        resource_type: ResourceType,
        config: &StatConfig,
        time: TimeSource,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            resource_type,
            stat: StatisticNode::new(config, time)?,
            origins: RwLock::new(HashMap::new()),
            config: config.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn stat(&self) -> &StatisticNode {
        &self.stat
    }

    /// The statistics of calls coming from `origin`, created on first use.
    pub fn origin_node(&self, origin: &str) -> Result<Arc<StatisticNode>, ConfigError> {
        if let Some(node) = self.origins.read().get(origin) {
            return Ok(Arc::clone(node));
        }

        let mut origins = self.origins.write();
        if let Some(node) = origins.get(origin) {
            return Ok(Arc::clone(node));
        }
        let node = Arc::new(StatisticNode::new(&self.config, self.stat.time().clone())?);
        origins.insert(origin.to_string(), Arc::clone(&node));
        Ok(node)
    }

    pub fn find_origin_node(&self, origin: &str) -> Option<Arc<StatisticNode>> {
        self.origins.read().get(origin).map(Arc::clone)
    }

    pub fn origins(&self) -> Vec<(String, Arc<StatisticNode>)> {
        let mut origins: Vec<_> = self
            .origins
            .read()
            .iter()
            .map(|(origin, node)| (origin.clone(), Arc::clone(node)))
            .collect();
        origins.sort_by(|a, b| a.0.cmp(&b.0));
        origins
    }
}

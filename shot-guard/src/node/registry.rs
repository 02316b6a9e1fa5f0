use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;
use tracing::warn;

use super::ClusterNode;
use super::DefaultNode;
use super::EntranceNode;
use super::ResourceType;
use super::ResourceWrapper;
use super::StatConfig;
use crate::clock::TimeSource;
use crate::config::EngineConfig;
use crate::error::ConfigError;

/// Name of the node that aggregates all inbound traffic.
pub const TOTAL_INBOUND_NAME: &str = "__total_inbound_traffic__";

/// Name of the context used by entries that were not given one.
pub const DEFAULT_CONTEXT_NAME: &str = "shot_guard_default_context";

/// Every node the engine creates, keyed for lookup.
///
/// Each map is guarded by its own lock and populated with double-checked
/// creation, so a resource or context name maps to exactly one node.
#[derive(Debug)]
pub struct NodeRegistry {
    config: StatConfig,
    time: TimeSource,
    max_resource_count: usize,
    max_context_count: usize,
    clusters: RwLock<HashMap<String, Arc<ClusterNode>>>,
    entrances: RwLock<HashMap<String, Arc<EntranceNode>>>,
    defaults: RwLock<HashMap<(String, String), Arc<DefaultNode>>>,
    inbound: Arc<ClusterNode>,
    overflowed: DashSet<String>,
}

impl From<&EngineConfig> for StatConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            second_sample_count: config.second_sample_count,
            second_interval_ms: config.second_interval_ms,
            minute_sample_count: config.minute_sample_count,
            minute_interval_ms: config.minute_interval_ms,
            occupy_timeout_ms: config.occupy_timeout_ms,
        }
    }
}

impl NodeRegistry {
    pub fn new(config: &EngineConfig, time: TimeSource) -> Result<Self, ConfigError> {
        let stat = StatConfig::from(config);
        let inbound = Arc::new(ClusterNode::new(
            TOTAL_INBOUND_NAME,
            ResourceType::Common,
            &stat,
            time.clone(),
        )?);
        Ok(Self {
            config: stat,
            time,
            max_resource_count: config.max_resource_count,
            max_context_count: config.max_context_count,
            clusters: RwLock::new(HashMap::new()),
            entrances: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            inbound,
            overflowed: DashSet::new(),
        })
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    pub fn stat_config(&self) -> &StatConfig {
        &self.config
    }

    pub fn inbound(&self) -> &Arc<ClusterNode> {
        &self.inbound
    }

    /// The entrance node of context `name`, or `None` once the context cap
    /// is reached.
    pub fn entrance(&self, name: &str) -> Option<Arc<EntranceNode>> {
        if let Some(node) = self.entrances.read().get(name) {
            return Some(Arc::clone(node));
        }

        let mut entrances = self.entrances.write();
        if let Some(node) = entrances.get(name) {
            return Some(Arc::clone(node));
        }
        if entrances.len() >= self.max_context_count {
            self.warn_overflow(name, "context");
            return None;
        }
        let node = Arc::new(EntranceNode::new(name));
        entrances.insert(name.to_string(), Arc::clone(&node));
        Some(node)
    }

    /// The cluster node of `resource`, or `None` once the resource cap is
    /// reached.
    pub fn cluster_node(
        &self,
        resource: &ResourceWrapper,
    ) -> Result<Option<Arc<ClusterNode>>, ConfigError> {
        if let Some(node) = self.clusters.read().get(resource.name()) {
            return Ok(Some(Arc::clone(node)));
        }

        let mut clusters = self.clusters.write();
        if let Some(node) = clusters.get(resource.name()) {
            return Ok(Some(Arc::clone(node)));
        }
        if clusters.len() >= self.max_resource_count {
            self.warn_overflow(resource.name(), "resource");
            return Ok(None);
        }
        let node = Arc::new(ClusterNode::new(
            resource.name(),
            resource.resource_type,
            &self.config,
            self.time.clone(),
        )?);
        clusters.insert(resource.name().to_string(), Arc::clone(&node));
        Ok(Some(node))
    }

    /// Lookup without creation.
    pub fn find_cluster_node(&self, name: &str) -> Option<Arc<ClusterNode>> {
        self.clusters.read().get(name).map(Arc::clone)
    }

    /// The node of `resource` under context `context`. A new node is hung
    /// below `parent`, or below the context's entrance for a root entry.
    pub fn default_node(
        &self,
        context: &str,
        resource: &ResourceWrapper,
        parent: Option<&Arc<DefaultNode>>,
        entrance: &EntranceNode,
    ) -> Result<Arc<DefaultNode>, ConfigError> {
        let key = (context.to_string(), resource.name().to_string());
        let existing = self.defaults.read().get(&key).map(Arc::clone);
        let node = match existing {
            Some(node) => node,
            None => {
                let mut defaults = self.defaults.write();
                match defaults.get(&key) {
                    Some(node) => Arc::clone(node),
                    None => {
                        let node = Arc::new(DefaultNode::new(
                            resource.clone(),
                            &self.config,
                            self.time.clone(),
                        )?);
                        defaults.insert(key, Arc::clone(&node));
                        node
                    }
                }
            }
        };

        // The same resource may be reached from different parents.
        match parent {
            Some(parent) => parent.add_child(Arc::clone(&node)),
            None => entrance.add_child(Arc::clone(&node)),
        }
        Ok(node)
    }

    pub fn cluster_nodes(&self) -> Vec<Arc<ClusterNode>> {
        let mut nodes: Vec<_> = self.clusters.read().values().map(Arc::clone).collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub fn entrances(&self) -> Vec<Arc<EntranceNode>> {
        let mut nodes: Vec<_> = self.entrances.read().values().map(Arc::clone).collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub fn resource_count(&self) -> usize {
        self.clusters.read().len()
    }

    /// Logs once per name that it went over its cap.
    pub fn warn_overflow(&self, name: &str, kind: &str) {
        if self.overflowed.insert(format!("{kind}:{name}")) {
            warn!(name, kind, "capacity reached, calls will not be checked");
        }
    }
}

use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;

use super::ClusterNode;
use super::ResourceWrapper;
use super::StatConfig;
use super::StatisticNode;
use crate::clock::TimeSource;
use crate::error::ConfigError;

/// Statistics of one resource as seen from one context.
///
/// Default nodes form the call tree under each context's entrance node.
/// Everything recorded here is recorded on the linked [`ClusterNode`] too.
#[derive(Debug)]
pub struct DefaultNode {
    id: ResourceWrapper,
    stat: StatisticNode,
    cluster: OnceLock<Arc<ClusterNode>>,
    children: RwLock<Vec<Arc<DefaultNode>>>,
}

impl DefaultNode {
    pub fn new(id: ResourceWrapper, config: &StatConfig, time: TimeSource) -> Result<Self, ConfigError> {
        Ok(Self {
            id,
            stat: StatisticNode::new(config, time)?,
            cluster: OnceLock::new(),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &ResourceWrapper {
        &self.id
    }

    pub fn stat(&self) -> &StatisticNode {
        &self.stat
    }

    pub fn cluster_node(&self) -> Option<&Arc<ClusterNode>> {
        self.cluster.get()
    }

    /// Links the cluster node. Only the first link sticks.
    pub fn set_cluster_node(&self, cluster: Arc<ClusterNode>) {
        let _ = self.cluster.set(cluster);
    }

    pub fn add_child(&self, child: Arc<DefaultNode>) {
        if self.children.read().iter().any(|c| c.id == child.id) {
            return;
        }
        let mut children = self.children.write();
        if !children.iter().any(|c| c.id == child.id) {
            children.push(child);
        }
    }

    pub fn children(&self) -> Vec<Arc<DefaultNode>> {
        self.children.read().clone()
    }

    pub fn add_pass_request(&self, count: u32) {
        self.stat.add_pass_request(count);
        if let Some(cluster) = self.cluster_node() {
            cluster.stat().add_pass_request(count);
        }
    }

    pub fn add_rt_and_success(&self, rt: u64, count: u32) {
        self.stat.add_rt_and_success(rt, count);
        if let Some(cluster) = self.cluster_node() {
            cluster.stat().add_rt_and_success(rt, count);
        }
    }

    pub fn increase_block_qps(&self, count: u32) {
        self.stat.increase_block_qps(count);
        if let Some(cluster) = self.cluster_node() {
            cluster.stat().increase_block_qps(count);
        }
    }

    pub fn increase_exception_qps(&self, count: u32) {
        self.stat.increase_exception_qps(count);
        if let Some(cluster) = self.cluster_node() {
            cluster.stat().increase_exception_qps(count);
        }
    }

    pub fn increase_thread_num(&self) {
        self.stat.increase_thread_num();
        if let Some(cluster) = self.cluster_node() {
            cluster.stat().increase_thread_num();
        }
    }

    pub fn decrease_thread_num(&self) {
        self.stat.decrease_thread_num();
        if let Some(cluster) = self.cluster_node() {
            cluster.stat().decrease_thread_num();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EntryType;
    use crate::node::ResourceType;

    #[test]
    fn records_on_cluster_too() {
        let (time, _mock) = TimeSource::mock();
        let config = StatConfig::default();
        let cluster =
            Arc::new(ClusterNode::new("svc", ResourceType::Common, &config, time.clone()).unwrap());

        let a = DefaultNode::new(ResourceWrapper::new("svc", EntryType::In), &config, time.clone())
            .unwrap();
        let b = DefaultNode::new(ResourceWrapper::new("svc", EntryType::In), &config, time).unwrap();
        a.set_cluster_node(Arc::clone(&cluster));
        b.set_cluster_node(Arc::clone(&cluster));

        a.add_pass_request(2);
        b.add_pass_request(1);
        b.increase_thread_num();

        assert_eq!(a.stat().pass_qps(), 2.0);
        assert_eq!(b.stat().pass_qps(), 1.0);
        assert_eq!(cluster.stat().pass_qps(), 3.0);
        assert_eq!(cluster.stat().cur_thread_num(), 1);
    }

    #[test]
    fn children_are_deduplicated() {
        let (time, _mock) = TimeSource::mock();
        let config = StatConfig::default();
        let parent =
            DefaultNode::new(ResourceWrapper::new("a", EntryType::Out), &config, time.clone()).unwrap();
        let child = Arc::new(
            DefaultNode::new(ResourceWrapper::new("b", EntryType::Out), &config, time).unwrap(),
        );
        parent.add_child(Arc::clone(&child));
        parent.add_child(child);
        assert_eq!(parent.children().len(), 1);
    }
}

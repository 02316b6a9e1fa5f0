use std::sync::Arc;

use parking_lot::RwLock;

use super::DefaultNode;

/// Root of one context's call tree. Its figures are the sums of its children.
#[derive(Debug)]
pub struct EntranceNode {
    name: String,
    children: RwLock<Vec<Arc<DefaultNode>>>,
}

impl EntranceNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_child(&self, child: Arc<DefaultNode>) {
        if self.children.read().iter().any(|c| c.id() == child.id()) {
            return;
        }
        let mut children = self.children.write();
        if !children.iter().any(|c| c.id() == child.id()) {
            children.push(child);
        }
    }

    pub fn children(&self) -> Vec<Arc<DefaultNode>> {
        self.children.read().clone()
    }

    fn sum<F>(&self, f: F) -> f64
    where
        F: Fn(&DefaultNode) -> f64,
    {
        self.children.read().iter().map(|c| f(c)).sum()
    }

    pub fn pass_qps(&self) -> f64 {
        self.sum(|c| c.stat().pass_qps())
    }

    pub fn block_qps(&self) -> f64 {
        self.sum(|c| c.stat().block_qps())
    }

    pub fn total_qps(&self) -> f64 {
        self.sum(|c| c.stat().total_qps())
    }

    pub fn success_qps(&self) -> f64 {
        self.sum(|c| c.stat().success_qps())
    }

    pub fn exception_qps(&self) -> f64 {
        self.sum(|c| c.stat().exception_qps())
    }

    pub fn cur_thread_num(&self) -> u64 {
        self.children
            .read()
            .iter()
            .map(|c| c.stat().cur_thread_num())
            .sum()
    }

    /// Success-weighted average response time of the children.
    pub fn avg_rt(&self) -> f64 {
        let children = self.children.read();
        let success: f64 = children.iter().map(|c| c.stat().success_qps()).sum();
        if success == 0.0 {
            return 0.0;
        }
        children
            .iter()
            .map(|c| c.stat().avg_rt() * c.stat().success_qps())
            .sum::<f64>()
            / success
    }

    pub fn total_request(&self) -> u64 {
        self.children
            .read()
            .iter()
            .map(|c| c.stat().total_request())
            .sum()
    }
}

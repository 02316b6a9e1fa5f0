use std::sync::Arc;
use std::time::Duration;

use super::Admission;
use super::FlowCheck;
use super::FlowRule;
use super::FlowStrategy;
use super::LIMIT_APP_DEFAULT;
use super::LIMIT_APP_OTHER;
use crate::error::BlockError;
use crate::error::SlotError;
use crate::node::ClusterNode;
use crate::node::DefaultNode;
use crate::node::StatisticNode;
use crate::slot::FLOW_ORDER;
use crate::slot::Slot;
use crate::slot::SlotContext;

/// The node whose statistics a flow rule is checked against.
#[derive(Debug, Clone)]
pub(crate) enum SelectedNode {
    Cluster(Arc<ClusterNode>),
    Default(Arc<DefaultNode>),
    Origin(Arc<StatisticNode>),
}

impl SelectedNode {
    pub(crate) fn stat(&self) -> &StatisticNode {
        match self {
            SelectedNode::Cluster(node) => node.stat(),
            SelectedNode::Default(node) => node.stat(),
            SelectedNode::Origin(node) => node,
        }
    }
}

/// A pass borrowed from a future window, given back if a later slot blocks
/// the call.
#[derive(Debug)]
pub(crate) struct Reservation {
    node: SelectedNode,
    booked_ms: u64,
    wait: Duration,
    acquire: u32,
}

impl Reservation {
    pub(crate) fn release(self) {
        self.node
            .stat()
            .release_occupied_pass(self.booked_ms, self.wait.as_millis() as u64, self.acquire);
    }
}

/// `origin` is named by no rule of the resource.
fn is_other_origin(origin: &str, checks: &[Arc<FlowCheck>]) -> bool {
    !origin.is_empty() && !checks.iter().any(|c| c.rule.limit_app == origin)
}

fn select_reference(rule: &FlowRule, ctx: &SlotContext) -> Option<SelectedNode> {
    let reference = rule.ref_resource.as_deref()?;
    match rule.strategy {
        FlowStrategy::Relate => ctx
            .core
            .registry
            .find_cluster_node(reference)
            .map(SelectedNode::Cluster),
        FlowStrategy::Chain if ctx.context().name() == reference => {
            ctx.node().cloned().map(SelectedNode::Default)
        }
        _ => None,
    }
}

/// Picks the node `rule` applies to for this call, or `None` when the rule
/// does not concern the caller.
pub(crate) fn select_node(
    rule: &FlowRule,
    checks: &[Arc<FlowCheck>],
    ctx: &SlotContext,
) -> Option<SelectedNode> {
    let origin = ctx.origin();
    let named_origin = origin != LIMIT_APP_DEFAULT && origin != LIMIT_APP_OTHER;

    let direct = if rule.limit_app == origin && named_origin {
        ctx.origin_node().cloned().map(SelectedNode::Origin)
    } else if rule.limit_app == LIMIT_APP_DEFAULT {
        ctx.cluster_node().cloned().map(SelectedNode::Cluster)
    } else if rule.limit_app == LIMIT_APP_OTHER && is_other_origin(origin, checks) {
        ctx.origin_node().cloned().map(SelectedNode::Origin)
    } else {
        return None;
    };

    if rule.strategy == FlowStrategy::Direct {
        direct
    } else {
        select_reference(rule, ctx)
    }
}

/// Checks every flow rule of the resource against the node it selects.
#[derive(Debug, Default)]
pub struct FlowSlot;

impl Slot for FlowSlot {
    fn name(&self) -> &str {
        "flow"
    }

    fn order(&self) -> i32 {
        FLOW_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let checks = ctx.core.flow.checks(ctx.resource().name());
        for check in &checks {
            let Some(node) = select_node(&check.rule, &checks, ctx) else {
                continue;
            };
            let admission = check.controller.can_pass(
                node.stat(),
                ctx.acquire_count(),
                ctx.prioritized(),
                ctx.cancel(),
            );
            match admission {
                Admission::Pass => {}
                Admission::Occupied { wait, booked_ms } => {
                    ctx.reservation = Some(Reservation {
                        node,
                        booked_ms,
                        wait,
                        acquire: ctx.acquire_count(),
                    });
                    return Err(SlotError::PriorityWait(wait));
                }
                Admission::Reject => {
                    return Err(BlockError::Flow {
                        resource: ctx.resource().name.clone(),
                        rule: Arc::clone(&check.rule),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn on_block(&self, ctx: &mut SlotContext) {
        if let Some(reservation) = ctx.reservation.take() {
            reservation.release();
        }
    }
}

use std::sync::Arc;

use super::CLUSTER_BUILDER_ORDER;
use super::Slot;
use super::SlotContext;
use crate::error::SlotError;

/// Links the per-context node to the resource's process-wide
/// [`ClusterNode`](crate::node::ClusterNode), and picks the origin node when
/// the context names a caller.
#[derive(Debug, Default)]
pub struct ClusterBuilderSlot;

impl Slot for ClusterBuilderSlot {
    fn name(&self) -> &str {
        "cluster-builder"
    }

    fn order(&self) -> i32 {
        CLUSTER_BUILDER_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let Some(node) = ctx.node.clone() else {
            return Ok(());
        };
        let cluster = match node.cluster_node() {
            Some(cluster) => Arc::clone(cluster),
            None => match ctx.core.registry.cluster_node(ctx.resource())? {
                Some(cluster) => {
                    node.set_cluster_node(Arc::clone(&cluster));
                    cluster
                }
                None => return Ok(()),
            },
        };
        if !ctx.origin().is_empty() {
            ctx.origin_node = Some(cluster.origin_node(ctx.origin())?);
        }
        ctx.cluster_node = Some(cluster);
        Ok(())
    }
}

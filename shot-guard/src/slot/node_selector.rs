use std::sync::Arc;

use super::NODE_SELECTOR_ORDER;
use super::Slot;
use super::SlotContext;
use crate::error::SlotError;

/// Finds (or creates) the [`DefaultNode`](crate::node::DefaultNode) of the
/// resource under the current context and hangs it in the call tree.
#[derive(Debug, Default)]
pub struct NodeSelectorSlot;

impl Slot for NodeSelectorSlot {
    fn name(&self) -> &str {
        "node-selector"
    }

    fn order(&self) -> i32 {
        NODE_SELECTOR_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let Some(entrance) = ctx.context().entrance().map(Arc::clone) else {
            return Ok(());
        };
        let parent = ctx.frame().parent.as_ref().and_then(|p| p.node());
        let node = ctx.core.registry.default_node(
            ctx.context().name(),
            ctx.resource(),
            parent.as_ref(),
            &entrance,
        )?;
        ctx.frame().set_node(Arc::clone(&node));
        ctx.node = Some(node);
        Ok(())
    }
}

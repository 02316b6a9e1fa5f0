use std::sync::Arc;

use super::BreakerPermit;
use crate::error::BlockError;
use crate::error::SlotError;
use crate::slot::DEGRADE_ORDER;
use crate::slot::Slot;
use crate::slot::SlotContext;

/// Rejects calls while a breaker of the resource is not closed, and feeds
/// completed calls back to the breakers.
#[derive(Debug, Default)]
pub struct DegradeSlot;

impl Slot for DegradeSlot {
    fn name(&self) -> &str {
        "degrade"
    }

    fn order(&self) -> i32 {
        DEGRADE_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let breakers = ctx.core.degrade.breakers(ctx.resource().name());
        for breaker in breakers {
            match breaker.try_pass() {
                BreakerPermit::Pass => {}
                BreakerPermit::Probe => ctx.probes.push(breaker),
                BreakerPermit::Deny => {
                    return Err(BlockError::Degrade {
                        resource: ctx.resource().name.clone(),
                        rule: Arc::clone(breaker.rule()),
                        state: breaker.state(),
                        param: None,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn on_block(&self, ctx: &mut SlotContext) {
        ctx.revert_probes();
    }

    fn exit(&self, ctx: &mut SlotContext) {
        if ctx.block_error().is_some() {
            return;
        }
        let ctx: &SlotContext = ctx;
        let breakers = ctx.core.degrade.breakers(ctx.resource().name());
        if breakers.is_empty() {
            return;
        }
        let overloaded = || {
            ctx.core
                .scenario
                .is_overloaded(ctx.resource().name(), ctx.cluster_node().map(Arc::as_ref))
        };
        for breaker in breakers {
            breaker.on_request_complete(ctx.rt(), ctx.error().is_some(), &overloaded);
        }
    }
}

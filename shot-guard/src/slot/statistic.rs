use super::STATISTIC_ORDER;
use super::Slot;
use super::SlotContext;
use crate::error::SlotError;

/// Records passes and blocks once the checks are decided, and response time,
/// success and exceptions when the entry exits.
///
/// Figures go to the context node (and through it the cluster node), to the
/// origin node and, for inbound resources, to the global inbound node.
#[derive(Debug, Default)]
pub struct StatisticSlot;

impl Slot for StatisticSlot {
    fn name(&self) -> &str {
        "statistic"
    }

    fn order(&self) -> i32 {
        STATISTIC_ORDER
    }

    fn entry(&self, _ctx: &mut SlotContext) -> Result<(), SlotError> {
        Ok(())
    }

    fn on_pass(&self, ctx: &mut SlotContext) {
        let count = ctx.acquire_count();
        // Occupied passes were already counted into their future window.
        let record_pass = !ctx.is_occupied();
        let inbound = ctx.resource().is_inbound().then(|| ctx.core.registry.inbound());

        if let Some(node) = ctx.node() {
            node.increase_thread_num();
            if record_pass {
                node.add_pass_request(count);
            }
        }
        if let Some(origin) = ctx.origin_node() {
            origin.increase_thread_num();
            if record_pass {
                origin.add_pass_request(count);
            }
        }
        if let Some(inbound) = inbound {
            inbound.stat().increase_thread_num();
            if record_pass {
                inbound.stat().add_pass_request(count);
            }
        }
    }

    fn on_block(&self, ctx: &mut SlotContext) {
        let count = ctx.acquire_count();
        if let Some(node) = ctx.node() {
            node.increase_block_qps(count);
        }
        if let Some(origin) = ctx.origin_node() {
            origin.increase_block_qps(count);
        }
        if ctx.resource().is_inbound() {
            ctx.core.registry.inbound().stat().increase_block_qps(count);
        }
    }

    fn exit(&self, ctx: &mut SlotContext) {
        if ctx.block_error().is_some() {
            return;
        }
        let count = ctx.acquire_count();
        let rt = ctx.rt().min(ctx.core.config.statistic_max_rt_ms);
        let failed = ctx.error().is_some();

        if let Some(node) = ctx.node() {
            node.add_rt_and_success(rt, count);
            node.decrease_thread_num();
            if failed {
                node.increase_exception_qps(count);
            }
        }
        if let Some(origin) = ctx.origin_node() {
            origin.add_rt_and_success(rt, count);
            origin.decrease_thread_num();
            if failed {
                origin.increase_exception_qps(count);
            }
        }
        if ctx.resource().is_inbound() {
            let inbound = ctx.core.registry.inbound().stat();
            inbound.add_rt_and_success(rt, count);
            inbound.decrease_thread_num();
            if failed {
                inbound.increase_exception_qps(count);
            }
        }
    }
}

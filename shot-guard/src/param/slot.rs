use std::sync::Arc;

use crate::error::BlockError;
use crate::error::SlotError;
use crate::flow::FlowGrade;
use crate::slot::PARAM_FLOW_ORDER;
use crate::slot::Slot;
use crate::slot::SlotContext;

/// Checks hot-parameter rules against the call's arguments. Calls without
/// the argument a rule names are not checked by it.
#[derive(Debug, Default)]
pub struct ParamFlowSlot;

impl Slot for ParamFlowSlot {
    fn name(&self) -> &str {
        "param-flow"
    }

    fn order(&self) -> i32 {
        PARAM_FLOW_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        let checks = ctx.core.param_flow.checks(ctx.resource().name());
        for check in checks {
            let Some(value) = ctx.arg(check.rule.param_idx) else {
                continue;
            };
            if !check.pass(ctx.time(), value, ctx.acquire_count(), ctx.cancel()) {
                return Err(BlockError::ParamFlow {
                    resource: ctx.resource().name.clone(),
                    rule: Arc::clone(&check.rule),
                    value: value.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn on_pass(&self, ctx: &mut SlotContext) {
        let checks = ctx.core.param_flow.checks(ctx.resource().name());
        for check in checks {
            if check.rule.grade != FlowGrade::Thread {
                continue;
            }
            let Some(value) = ctx.arg(check.rule.param_idx).cloned() else {
                continue;
            };
            check.metric.increase_thread(&value);
            ctx.param_threads.push((Arc::clone(&check.metric), value));
        }
    }

    fn exit(&self, ctx: &mut SlotContext) {
        for (metric, value) in ctx.param_threads.drain(..) {
            metric.decrease_thread(&value);
        }
    }
}

use super::SystemMetric;
use super::SystemRule;
use crate::error::BlockError;
use crate::error::SlotError;
use crate::slot::SYSTEM_ORDER;
use crate::slot::Slot;
use crate::slot::SlotContext;

/// Guards the whole process against inbound overload, measured on the
/// global inbound node. Outbound entries are never checked.
#[derive(Debug, Default)]
pub struct SystemSlot;

/// The first threshold of `rule` the call would break, as
/// `(metric, current value, threshold)`.
fn violation(ctx: &SlotContext, rule: &SystemRule) -> Option<(SystemMetric, f64, f64)> {
    let inbound = ctx.core.registry.inbound().stat();
    let status = &ctx.core.status;

    let qps = inbound.pass_qps();
    if rule.qps >= 0.0 && qps + ctx.acquire_count() as f64 > rule.qps {
        return Some((SystemMetric::Qps, qps, rule.qps));
    }
    let threads = inbound.cur_thread_num() as f64;
    if rule.max_thread >= 0.0 && threads > rule.max_thread {
        return Some((SystemMetric::Thread, threads, rule.max_thread));
    }
    let avg_rt = inbound.avg_rt();
    if rule.avg_rt >= 0.0 && avg_rt > rule.avg_rt {
        return Some((SystemMetric::Rt, avg_rt, rule.avg_rt));
    }
    let load = status.load();
    if rule.highest_system_load >= 0.0 && load > rule.highest_system_load {
        // Under high load, admit while concurrency stays within what the
        // measured throughput and fastest response time can sustain.
        let min_rt = inbound.min_rt(ctx.core.config.statistic_max_rt_ms) as f64;
        if threads > 1.0 && threads > inbound.max_success_qps() * min_rt / 1000.0 {
            return Some((SystemMetric::Load, load, rule.highest_system_load));
        }
    }
    let cpu = status.cpu_usage();
    if rule.highest_cpu_usage >= 0.0 && cpu > rule.highest_cpu_usage {
        return Some((SystemMetric::Cpu, cpu, rule.highest_cpu_usage));
    }
    None
}

impl Slot for SystemSlot {
    fn name(&self) -> &str {
        "system"
    }

    fn order(&self) -> i32 {
        SYSTEM_ORDER
    }

    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
        if !ctx.resource().is_inbound() {
            return Ok(());
        }
        let Some(rule) = ctx.core.system.merged() else {
            return Ok(());
        };
        match violation(ctx, &rule) {
            Some((metric, value, threshold)) => Err(BlockError::System {
                resource: ctx.resource().name.clone(),
                rule,
                metric,
                value,
                threshold,
            }
            .into()),
            None => Ok(()),
        }
    }
}

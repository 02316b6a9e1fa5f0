use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tracing::debug;

use super::LOG_ORDER;
use super::Slot;
use super::SlotContext;
use crate::error::SlotError;

/// Logs blocked entries and counts them on the `shot_guard` meter.
#[derive(Debug, Clone)]
pub struct LogSlot {
    blocked: Counter<u64>,
}

impl Default for LogSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSlot {
    pub fn new() -> Self {
        let meter = global::meter("shot_guard");
        Self {
            blocked: meter.u64_counter("blocked_requests").build(),
        }
    }
}

impl Slot for LogSlot {
    fn name(&self) -> &str {
        "log"
    }

    fn order(&self) -> i32 {
        LOG_ORDER
    }

    fn entry(&self, _ctx: &mut SlotContext) -> Result<(), SlotError> {
        Ok(())
    }

    fn on_block(&self, ctx: &mut SlotContext) {
        let Some(err) = ctx.block_error() else {
            return;
        };
        debug!(
            resource = %ctx.resource(),
            origin = ctx.origin(),
            context = ctx.context().name(),
            reason = %err.reason(),
            "{err}"
        );
        self.blocked.add(
            ctx.acquire_count() as u64,
            &[
                KeyValue::new("resource", ctx.resource().name.clone()),
                KeyValue::new("reason", err.reason().to_string()),
            ],
        );
    }
}

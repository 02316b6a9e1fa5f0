use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use super::Slot;
use super::SlotContext;
use crate::error::BlockError;
use crate::error::SlotError;

/// The slots of one resource, in execution order.
#[derive(Debug, Clone)]
pub struct SlotChain {
    slots: Vec<Arc<dyn Slot>>,
}

/// Runs a slot hook, turning a panic into a logged no-op.
fn guarded<R>(slot: &dyn Slot, stage: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(_) => {
            warn!(slot = slot.name(), stage, "slot panicked, treating as allow");
            None
        }
    }
}

impl SlotChain {
    pub fn new(slots: Vec<Arc<dyn Slot>>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[Arc<dyn Slot>] {
        &self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Runs the `entry` hooks. On a block, unwinds the slots that ran and
    /// returns the block.
    pub(crate) fn entry(&self, ctx: &mut SlotContext) -> Result<(), BlockError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            ctx.ran = idx + 1;
            match guarded(slot.as_ref(), "entry", || slot.entry(ctx)) {
                None | Some(Ok(())) => {}
                Some(Err(SlotError::Block(err))) => {
                    debug!(
                        resource = %ctx.resource(),
                        slot = slot.name(),
                        reason = %err.reason(),
                        "entry blocked"
                    );
                    ctx.block_error = Some(err.clone());
                    self.each_ran_reversed(ctx, "on_block", |s, c| s.on_block(c));
                    self.each_ran_reversed(ctx, "exit", |s, c| s.exit(c));
                    return Err(err);
                }
                Some(Err(SlotError::PriorityWait(wait))) => {
                    // Admitted into a future window. Later slots still check
                    // the call, and a block there gives the window back.
                    ctx.occupied = Some(wait);
                }
                Some(Err(SlotError::Internal(msg))) => {
                    warn!(
                        resource = %ctx.resource(),
                        slot = slot.name(),
                        error = %msg,
                        "slot failed, treating as allow"
                    );
                }
            }
        }
        self.each_ran_reversed(ctx, "on_pass", |s, c| s.on_pass(c));
        Ok(())
    }

    /// Runs the `exit` hooks of the slots that saw the entry.
    pub(crate) fn exit(&self, ctx: &mut SlotContext) {
        self.each_ran_reversed(ctx, "exit", |s, c| s.exit(c));
    }

    fn each_ran_reversed<F>(&self, ctx: &mut SlotContext, stage: &'static str, f: F)
    where
        F: Fn(&dyn Slot, &mut SlotContext),
    {
        let ran = ctx.ran.min(self.slots.len());
        for slot in self.slots[..ran].iter().rev() {
            guarded(slot.as_ref(), stage, || f(slot.as_ref(), ctx));
        }
    }
}

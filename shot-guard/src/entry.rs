use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::node::DefaultNode;
use crate::slot::SlotChain;
use crate::slot::SlotContext;

/// One admitted call through a resource.
///
/// Call [`Entry::exit`] once the protected work is done. An entry that is
/// dropped without calling `exit` exits on drop, so every admitted call is
/// unwound exactly once.
///
/// ```rust
/// use shot_guard::Engine;
///
/// let engine = Engine::builder().build().unwrap();
/// match engine.entry("orders").build() {
///     Ok(mut entry) => {
///         if let Err(e) = "42".parse::<u32>() {
///             entry.set_error(e.to_string());
///         }
///         entry.exit();
///     }
///     Err(blocked) => eprintln!("fallback: {blocked}"),
/// }
/// ```
pub struct Entry {
    chain: Option<Arc<SlotChain>>,
    ctx: SlotContext,
    exited: bool,
}

impl Entry {
    pub(crate) fn new(chain: Option<Arc<SlotChain>>, ctx: SlotContext) -> Self {
        Self {
            chain,
            ctx,
            exited: false,
        }
    }

    pub fn resource(&self) -> &str {
        self.ctx.resource().name()
    }

    pub fn context(&self) -> &Arc<Context> {
        self.ctx.context()
    }

    /// The per-context node, unless the entry was admitted unchecked.
    pub fn node(&self) -> Option<&Arc<DefaultNode>> {
        self.ctx.node()
    }

    /// False for entries that bypassed the slot chain because a capacity
    /// cap was reached.
    pub fn is_checked(&self) -> bool {
        self.chain.is_some()
    }

    /// True when a prioritized call was admitted into a future window.
    pub fn is_occupied(&self) -> bool {
        self.ctx.is_occupied()
    }

    /// Marks the call as failed. Counted as an exception on exit.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.ctx.set_error(error.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.ctx.error()
    }

    pub fn exit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        let now = self.ctx.time().now_ms();
        self.ctx.complete_at(now);
        if let Some(chain) = &self.chain {
            chain.exit(&mut self.ctx);
        }
        self.ctx.context().pop(self.ctx.frame());
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("resource", &self.resource())
            .field("context", &self.context().name())
            .field("checked", &self.is_checked())
            .finish()
    }
}

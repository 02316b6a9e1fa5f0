//! The slot chain: the ordered stages every entry passes through.
//!
//! Stages run their `entry` hook front to back. The first block stops the
//! chain; the stages that already ran then get `on_block` followed by `exit`.
//! An admitted entry gets `on_pass` on every stage that ran, and `exit` when
//! the caller exits. Both run back to front.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod chain;
mod cluster_builder;
mod log;
mod node_selector;
mod statistic;

pub use chain::SlotChain;
pub use cluster_builder::ClusterBuilderSlot;
pub use log::LogSlot;
pub use node_selector::NodeSelectorSlot;
pub use statistic::StatisticSlot;

use crate::clock::CancelToken;
use crate::clock::TimeSource;
use crate::context::Context;
use crate::context::Frame;
use crate::degrade::CircuitBreaker;
use crate::engine::Core;
use crate::error::BlockError;
use crate::error::SlotError;
use crate::flow::Reservation;
use crate::node::ClusterNode;
use crate::node::DefaultNode;
use crate::node::ResourceWrapper;
use crate::node::StatisticNode;
use crate::param::ParamValue;
use crate::param::ParameterMetric;

pub const NODE_SELECTOR_ORDER: i32 = -10_000;
pub const CLUSTER_BUILDER_ORDER: i32 = -9_000;
pub const LOG_ORDER: i32 = -8_000;
pub const STATISTIC_ORDER: i32 = -7_000;
pub const AUTHORITY_ORDER: i32 = -6_000;
pub const SYSTEM_ORDER: i32 = -5_000;
pub const PARAM_FLOW_ORDER: i32 = -3_000;
pub const PARAM_DEGRADE_ORDER: i32 = -2_500;
pub const FLOW_ORDER: i32 = -2_000;
pub const DEGRADE_ORDER: i32 = -1_000;

/// A stage of the slot chain.
///
/// Slots are shared by every entry of a resource and must keep per-call
/// state in the [`SlotContext`].
pub trait Slot: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Lower runs earlier.
    fn order(&self) -> i32;

    /// Checks or prepares the call.
    ///
    /// # Errors
    ///
    /// [`SlotError::Block`] rejects the call. [`SlotError::Internal`] is
    /// logged and ignored.
    fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError>;

    fn on_pass(&self, _ctx: &mut SlotContext) {}

    fn on_block(&self, _ctx: &mut SlotContext) {}

    fn exit(&self, _ctx: &mut SlotContext) {}
}

/// Per-call state shared by the slots of one entry.
pub struct SlotContext {
    pub(crate) core: Arc<Core>,
    resource: ResourceWrapper,
    context: Arc<Context>,
    frame: Arc<Frame>,
    acquire_count: u32,
    prioritized: bool,
    args: Vec<ParamValue>,
    cancel: Option<CancelToken>,
    start_ms: u64,
    rt: u64,
    error: Option<String>,
    pub(crate) node: Option<Arc<DefaultNode>>,
    pub(crate) cluster_node: Option<Arc<ClusterNode>>,
    pub(crate) origin_node: Option<Arc<StatisticNode>>,
    pub(crate) block_error: Option<BlockError>,
    pub(crate) occupied: Option<Duration>,
    /// The future-window pass behind `occupied`.
    pub(crate) reservation: Option<Reservation>,
    /// Breakers that let this call through as their half-open probe.
    pub(crate) probes: Vec<Arc<dyn CircuitBreaker>>,
    /// Parameter breakers picked for this call, fed on exit.
    pub(crate) param_breakers: Vec<Arc<dyn CircuitBreaker>>,
    /// Parameter values whose concurrency was raised on pass.
    pub(crate) param_threads: Vec<(Arc<ParameterMetric>, ParamValue)>,
    /// How many slots had their `entry` hook invoked.
    pub(crate) ran: usize,
}

pub(crate) struct CallSpec {
    pub(crate) acquire_count: u32,
    pub(crate) prioritized: bool,
    pub(crate) args: Vec<ParamValue>,
    pub(crate) cancel: Option<CancelToken>,
}

impl SlotContext {
    pub(crate) fn new(
        core: Arc<Core>,
        resource: ResourceWrapper,
        context: Arc<Context>,
        frame: Arc<Frame>,
        call: CallSpec,
    ) -> Self {
        let start_ms = core.time.now_ms();
        Self {
            core,
            resource,
            context,
            frame,
            acquire_count: call.acquire_count,
            prioritized: call.prioritized,
            args: call.args,
            cancel: call.cancel,
            start_ms,
            rt: 0,
            error: None,
            node: None,
            cluster_node: None,
            origin_node: None,
            block_error: None,
            occupied: None,
            reservation: None,
            probes: Vec::new(),
            param_breakers: Vec::new(),
            param_threads: Vec::new(),
            ran: 0,
        }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        &self.resource
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub(crate) fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn origin(&self) -> &str {
        self.context.origin()
    }

    pub fn acquire_count(&self) -> u32 {
        self.acquire_count
    }

    pub fn prioritized(&self) -> bool {
        self.prioritized
    }

    pub fn args(&self) -> &[ParamValue] {
        &self.args
    }

    pub fn cancel(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    pub fn time(&self) -> &TimeSource {
        &self.core.time
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    /// Response time in milliseconds; set when the entry exits.
    pub fn rt(&self) -> u64 {
        self.rt
    }

    pub fn node(&self) -> Option<&Arc<DefaultNode>> {
        self.node.as_ref()
    }

    pub fn cluster_node(&self) -> Option<&Arc<ClusterNode>> {
        self.cluster_node.as_ref()
    }

    pub fn origin_node(&self) -> Option<&Arc<StatisticNode>> {
        self.origin_node.as_ref()
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        self.block_error.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.is_some()
    }

    pub(crate) fn set_error(&mut self, error: String) {
        self.error = Some(error);
    }

    pub(crate) fn complete_at(&mut self, now: u64) {
        self.rt = now.saturating_sub(self.start_ms);
    }

    /// The argument at `idx`; negative indexes count from the end.
    pub fn arg(&self, idx: isize) -> Option<&ParamValue> {
        let idx = if idx < 0 {
            self.args.len().checked_sub(idx.unsigned_abs())?
        } else {
            idx as usize
        };
        self.args.get(idx)
    }

    /// Sends every half-open breaker this call probed back to open.
    pub(crate) fn revert_probes(&mut self) {
        for breaker in self.probes.drain(..) {
            breaker.revert_probe();
        }
    }
}

impl fmt::Debug for SlotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotContext")
            .field("resource", &self.resource.name)
            .field("context", &self.context.name())
            .field("acquire_count", &self.acquire_count)
            .field("prioritized", &self.prioritized)
            .field("blocked", &self.block_error.is_some())
            .finish()
    }
}

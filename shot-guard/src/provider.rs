//! Explicit registration of slots and custom traffic shaping controllers.
//!
//! The built-in chain is registered by [`ProviderRegistry::default`]; user
//! slots are added with [`ProviderRegistry::register_slot`] and slot into
//! the chain by their order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use tracing::debug;

use crate::authority::AuthoritySlot;
use crate::degrade::DegradeSlot;
use crate::flow::FlowRule;
use crate::flow::FlowSlot;
use crate::flow::TrafficShapingController;
use crate::param::ParamDegradeSlot;
use crate::param::ParamFlowSlot;
use crate::slot::AUTHORITY_ORDER;
use crate::slot::CLUSTER_BUILDER_ORDER;
use crate::slot::ClusterBuilderSlot;
use crate::slot::DEGRADE_ORDER;
use crate::slot::FLOW_ORDER;
use crate::slot::LOG_ORDER;
use crate::slot::LogSlot;
use crate::slot::NODE_SELECTOR_ORDER;
use crate::slot::NodeSelectorSlot;
use crate::slot::PARAM_DEGRADE_ORDER;
use crate::slot::PARAM_FLOW_ORDER;
use crate::slot::STATISTIC_ORDER;
use crate::slot::Slot;
use crate::slot::StatisticSlot;
use crate::slot::SYSTEM_ORDER;
use crate::system::SystemSlot;

pub type SlotFactory = Arc<dyn Fn() -> Arc<dyn Slot> + Send + Sync>;

pub type ControllerFactory =
    Arc<dyn Fn(&FlowRule) -> Arc<dyn TrafficShapingController> + Send + Sync>;

/// How to make one stage of the slot chain.
#[derive(Clone)]
pub struct SlotProvider {
    pub alias: String,
    pub order: i32,
    /// Share one instance between every chain instead of building one per
    /// resource.
    pub singleton: bool,
    pub factory: SlotFactory,
}

impl SlotProvider {
    pub fn new(alias: impl Into<String>, order: i32, factory: SlotFactory) -> Self {
        Self {
            alias: alias.into(),
            order,
            singleton: true,
            factory,
        }
    }

    /// A provider building a fresh slot for every chain.
    pub fn prototype(alias: impl Into<String>, order: i32, factory: SlotFactory) -> Self {
        Self {
            singleton: false,
            ..Self::new(alias, order, factory)
        }
    }
}

impl fmt::Debug for SlotProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotProvider")
            .field("alias", &self.alias)
            .field("order", &self.order)
            .field("singleton", &self.singleton)
            .finish()
    }
}

struct Registered {
    provider: SlotProvider,
    seq: usize,
    instance: OnceLock<Arc<dyn Slot>>,
}

impl Registered {
    fn slot(&self) -> Arc<dyn Slot> {
        if self.provider.singleton {
            Arc::clone(self.instance.get_or_init(|| (self.provider.factory)()))
        } else {
            (self.provider.factory)()
        }
    }
}

/// Slot and controller providers known to an engine.
pub struct ProviderRegistry {
    slots: Vec<Registered>,
    next_seq: usize,
    controllers: HashMap<String, ControllerFactory>,
}

fn factory<S: Slot + Default + 'static>() -> SlotFactory {
    Arc::new(|| Arc::new(S::default()) as Arc<dyn Slot>)
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for provider in [
            SlotProvider::new("node-selector", NODE_SELECTOR_ORDER, factory::<NodeSelectorSlot>()),
            SlotProvider::new("cluster-builder", CLUSTER_BUILDER_ORDER, factory::<ClusterBuilderSlot>()),
            SlotProvider::new("log", LOG_ORDER, factory::<LogSlot>()),
            SlotProvider::new("statistic", STATISTIC_ORDER, factory::<StatisticSlot>()),
            SlotProvider::new("authority", AUTHORITY_ORDER, factory::<AuthoritySlot>()),
            SlotProvider::new("system", SYSTEM_ORDER, factory::<SystemSlot>()),
            SlotProvider::new("param-flow", PARAM_FLOW_ORDER, factory::<ParamFlowSlot>()),
            SlotProvider::new("param-degrade", PARAM_DEGRADE_ORDER, factory::<ParamDegradeSlot>()),
            SlotProvider::new("flow", FLOW_ORDER, factory::<FlowSlot>()),
            SlotProvider::new("degrade", DEGRADE_ORDER, factory::<DegradeSlot>()),
        ] {
            registry.register_slot(provider);
        }
        registry
    }
}

impl ProviderRegistry {
    /// No slots at all: every entry passes unchecked.
    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            next_seq: 0,
            controllers: HashMap::new(),
        }
    }

    /// Adds a slot provider, replacing any provider with the same alias.
    pub fn register_slot(&mut self, provider: SlotProvider) {
        self.slots.retain(|r| r.provider.alias != provider.alias);
        debug!(alias = %provider.alias, order = provider.order, "slot provider registered");
        self.slots.push(Registered {
            provider,
            seq: self.next_seq,
            instance: OnceLock::new(),
        });
        self.next_seq += 1;
    }

    /// The chain's slots, by order and then registration sequence.
    pub fn load_slots(&self) -> Vec<Arc<dyn Slot>> {
        let mut registered: Vec<&Registered> = self.slots.iter().collect();
        registered.sort_by_key(|r| (r.provider.order, r.seq));
        registered.into_iter().map(Registered::slot).collect()
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut registered: Vec<&Registered> = self.slots.iter().collect();
        registered.sort_by_key(|r| (r.provider.order, r.seq));
        registered
            .into_iter()
            .map(|r| r.provider.alias.clone())
            .collect()
    }

    /// Makes `ControlBehavior::Custom(alias)` flow rules use `factory`.
    pub fn register_controller(&mut self, alias: impl Into<String>, factory: ControllerFactory) {
        let alias = alias.into();
        debug!(%alias, "controller provider registered");
        self.controllers.insert(alias, factory);
    }

    pub fn controller(&self, alias: &str) -> Option<ControllerFactory> {
        self.controllers.get(alias).map(Arc::clone)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut controllers: Vec<_> = self.controllers.keys().collect();
        controllers.sort();
        f.debug_struct("ProviderRegistry")
            .field("slots", &self.aliases())
            .field("controllers", &controllers)
            .finish()
    }
}

//! The process-scoped engine: node registry, rule managers, slot chains.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;
use tracing::info;

use crate::authority::AuthorityRuleManager;
use crate::clock::CancelToken;
use crate::clock::TimeSource;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::context::Frame;
use crate::degrade::BreakerListeners;
use crate::degrade::DegradeRuleManager;
use crate::degrade::StateChangeListener;
use crate::entry::Entry;
use crate::error::BlockError;
use crate::error::ConfigError;
use crate::flow::FlowRuleManager;
use crate::node::DEFAULT_CONTEXT_NAME;
use crate::node::EntryType;
use crate::node::NodeRegistry;
use crate::node::ResourceType;
use crate::node::ResourceWrapper;
use crate::param::ParamDegradeRuleManager;
use crate::param::ParamFlowRuleManager;
use crate::param::ParamValue;
use crate::provider::ControllerFactory;
use crate::provider::ProviderRegistry;
use crate::provider::SlotProvider;
use crate::scenario::ScenarioDetector;
use crate::slot::CallSpec;
use crate::slot::SlotChain;
use crate::slot::SlotContext;
use crate::system::SamplerHandle;
use crate::system::SystemRuleManager;
use crate::system::SystemStatus;

/// State shared by every entry of one engine.
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) config: EngineConfig,
    pub(crate) time: TimeSource,
    pub(crate) registry: NodeRegistry,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) flow: FlowRuleManager,
    pub(crate) degrade: DegradeRuleManager,
    pub(crate) param_flow: ParamFlowRuleManager,
    pub(crate) param_degrade: ParamDegradeRuleManager,
    pub(crate) system: SystemRuleManager,
    pub(crate) authority: AuthorityRuleManager,
    pub(crate) scenario: ScenarioDetector,
    pub(crate) status: Arc<SystemStatus>,
    pub(crate) listeners: Arc<BreakerListeners>,
    chains: RwLock<HashMap<String, Arc<SlotChain>>>,
    _sampler: Option<SamplerHandle>,
}

impl Core {
    /// The chain of `resource`, built on first use. `None` once the
    /// resource cap is reached.
    fn chain(&self, resource: &ResourceWrapper) -> Option<Arc<SlotChain>> {
        if let Some(chain) = self.chains.read().get(resource.name()) {
            return Some(Arc::clone(chain));
        }

        let mut chains = self.chains.write();
        if let Some(chain) = chains.get(resource.name()) {
            return Some(Arc::clone(chain));
        }
        if chains.len() >= self.config.max_resource_count {
            self.registry.warn_overflow(resource.name(), "chain");
            return None;
        }
        let chain = Arc::new(SlotChain::new(self.providers.load_slots()));
        debug!(resource = %resource, slots = chain.slots().len(), "slot chain built");
        chains.insert(resource.name().to_string(), Arc::clone(&chain));
        Some(chain)
    }
}

/// Builds an [`Engine`].
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    time: Option<TimeSource>,
    providers: Option<ProviderRegistry>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Drives the engine from `time`, typically a mocked source in tests.
    pub fn time_source(mut self, time: TimeSource) -> Self {
        self.time = Some(time);
        self
    }

    /// Replaces the built-in slot and controller providers.
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Adds a slot to the built-in chain.
    pub fn register_slot(mut self, provider: SlotProvider) -> Self {
        self.providers
            .get_or_insert_with(ProviderRegistry::default)
            .register_slot(provider);
        self
    }

    pub fn register_controller(mut self, alias: impl Into<String>, factory: ControllerFactory) -> Self {
        self.providers
            .get_or_insert_with(ProviderRegistry::default)
            .register_controller(alias, factory);
        self
    }

    /// # Errors
    ///
    /// Fails on an invalid [`EngineConfig`], or when the system sampler
    /// thread cannot be started.
    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        let time = self.time.unwrap_or_default();
        let providers = Arc::new(self.providers.unwrap_or_default());
        let listeners = Arc::new(BreakerListeners::default());
        let status = Arc::new(SystemStatus::new());

        let sampler = match self.config.system_sample_interval_ms {
            Some(ms) => Some(
                status
                    .spawn_sampler(Duration::from_millis(ms))
                    .map_err(|e| ConfigError::InvalidConfig(format!("cannot start system sampler: {e}")))?,
            ),
            None => None,
        };

        let core = Core {
            registry: NodeRegistry::new(&self.config, time.clone())?,
            flow: FlowRuleManager::new(self.config.cold_factor, Arc::clone(&providers)),
            degrade: DegradeRuleManager::new(time.clone(), Arc::clone(&listeners)),
            param_flow: ParamFlowRuleManager::new(),
            param_degrade: ParamDegradeRuleManager::new(time.clone(), Arc::clone(&listeners)),
            system: SystemRuleManager::new(),
            authority: AuthorityRuleManager::new(),
            scenario: ScenarioDetector::new(Arc::clone(&status)),
            status,
            listeners,
            providers,
            chains: RwLock::new(HashMap::new()),
            _sampler: sampler,
            time,
            config: self.config,
        };
        info!(app = %core.config.app_name, "engine started");
        Ok(Engine { core: Arc::new(core) })
    }
}

/// Admission control for named resources.
///
/// Cloning is cheap; clones share every node, rule and chain.
#[derive(Clone)]
pub struct Engine {
    core: Arc<Core>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn time(&self) -> &TimeSource {
        &self.core.time
    }

    /// Opens a call chain named `name` for caller `origin`.
    ///
    /// Past the context cap the context is null and its entries are not
    /// checked.
    pub fn enter(&self, name: &str, origin: &str) -> Arc<Context> {
        let entrance = self.core.registry.entrance(name);
        Arc::new(Context::new(name, origin, entrance))
    }

    /// Starts building an entry for `resource`.
    pub fn entry(&self, resource: impl Into<String>) -> EntryBuilder<'_> {
        EntryBuilder {
            engine: self,
            resource: resource.into(),
            entry_type: EntryType::Out,
            resource_type: ResourceType::Common,
            count: 1,
            prioritized: false,
            args: Vec::new(),
            context: None,
            cancel: None,
        }
    }

    pub fn flow_rules(&self) -> &FlowRuleManager {
        &self.core.flow
    }

    pub fn degrade_rules(&self) -> &DegradeRuleManager {
        &self.core.degrade
    }

    pub fn param_flow_rules(&self) -> &ParamFlowRuleManager {
        &self.core.param_flow
    }

    pub fn param_degrade_rules(&self) -> &ParamDegradeRuleManager {
        &self.core.param_degrade
    }

    pub fn system_rules(&self) -> &SystemRuleManager {
        &self.core.system
    }

    pub fn authority_rules(&self) -> &AuthorityRuleManager {
        &self.core.authority
    }

    pub fn scenario(&self) -> &ScenarioDetector {
        &self.core.scenario
    }

    pub fn system_status(&self) -> &Arc<SystemStatus> {
        &self.core.status
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.core.registry
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.core.providers
    }

    /// Subscribes to every circuit breaker state change.
    pub fn add_state_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.core.listeners.add(listener);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("app_name", &self.core.config.app_name)
            .field("resources", &self.core.registry.resource_count())
            .finish()
    }
}

/// Describes one call before it is checked.
#[derive(Debug)]
pub struct EntryBuilder<'a> {
    engine: &'a Engine,
    resource: String,
    entry_type: EntryType,
    resource_type: ResourceType,
    count: u32,
    prioritized: bool,
    args: Vec<ParamValue>,
    context: Option<Arc<Context>>,
    cancel: Option<CancelToken>,
}

impl EntryBuilder<'_> {
    /// Inbound entries also count against system rules.
    pub fn with_entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = entry_type;
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    /// Tokens the call takes; 1 by default.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Lets a call that would exceed a QPS rule wait for a future window.
    pub fn prioritized(mut self) -> Self {
        self.prioritized = true;
        self
    }

    pub fn with_args(mut self, args: Vec<ParamValue>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<ParamValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_context(mut self, context: &Arc<Context>) -> Self {
        self.context = Some(Arc::clone(context));
        self
    }

    /// Ends any queueing wait early, as a block.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Runs the checks.
    ///
    /// # Errors
    ///
    /// The [`BlockError`] of the first slot that rejected the call. Nothing
    /// needs to be exited for a blocked call.
    pub fn build(self) -> Result<Entry, BlockError> {
        let core = &self.engine.core;
        let context = self
            .context
            .unwrap_or_else(|| self.engine.enter(DEFAULT_CONTEXT_NAME, ""));
        let resource = ResourceWrapper::new(self.resource, self.entry_type)
            .with_resource_type(self.resource_type);

        let frame = Arc::new(Frame::new(resource.clone(), context.current()));
        context.push(Arc::clone(&frame));

        let chain = if context.is_null() {
            None
        } else {
            core.chain(&resource)
        };
        let call = CallSpec {
            acquire_count: self.count,
            prioritized: self.prioritized,
            args: self.args,
            cancel: self.cancel,
        };
        let mut ctx = SlotContext::new(Arc::clone(core), resource, context, frame, call);

        let Some(chain) = chain else {
            return Ok(Entry::new(None, ctx));
        };
        match chain.entry(&mut ctx) {
            Ok(()) => Ok(Entry::new(Some(chain), ctx)),
            Err(err) => {
                ctx.context().pop(ctx.frame());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::authority::AuthorityRule;
    use crate::clock::MOCK_EPOCH_MS;
    use crate::degrade::BreakerStrategy;
    use crate::degrade::CircuitBreaker;
    use crate::degrade::DegradeRule;
    use crate::degrade::State;
    use crate::error::SlotError;
    use crate::flow::FlowGrade;
    use crate::flow::FlowRule;
    use crate::param::ParamFlowRule;
    use crate::slot::FLOW_ORDER;
    use crate::slot::Slot;
    use crate::system::SystemRule;

    fn engine() -> (Engine, Arc<quanta::Mock>) {
        let (time, mock) = TimeSource::mock();
        let engine = Engine::builder().time_source(time).build().unwrap();
        (engine, mock)
    }

    #[test]
    fn qps_limit_resets_with_the_window() {
        let (engine, mock) = engine();
        engine
            .flow_rules()
            .load_rules(vec![FlowRule::new("svc", FlowGrade::Qps, 1.0)])
            .unwrap();

        engine.entry("svc").build().unwrap().exit();
        let err = engine.entry("svc").build().unwrap_err();
        assert!(matches!(err, BlockError::Flow { .. }));
        assert_eq!(err.resource(), "svc");

        mock.increment(Duration::from_millis(1000));
        engine.entry("svc").build().unwrap().exit();
    }

    #[test]
    fn slow_calls_open_the_breaker_until_a_probe_succeeds() {
        let (engine, mock) = engine();
        let rule = DegradeRule::new(
            "svc",
            BreakerStrategy::SlowRequestRatio {
                max_allowed_rt_ms: 100,
                threshold: 0.5,
            },
        )
        .with_min_request_amount(10)
        .with_stat_interval_ms(10_000)
        .with_recovery_timeout_ms(5_000);
        engine.degrade_rules().load_rules(vec![rule]).unwrap();

        for i in 0..10 {
            let entry = engine.entry("svc").build().unwrap();
            if i >= 4 {
                mock.increment(Duration::from_millis(150));
            }
            entry.exit();
        }

        let err = engine.entry("svc").build().unwrap_err();
        assert!(err.is_circuit_open());
        assert!(matches!(err, BlockError::Degrade { state: State::Open, .. }));

        mock.increment(Duration::from_millis(5_000));
        let probe = engine.entry("svc").build().unwrap();
        // Only the probe gets through while half-open.
        assert!(engine.entry("svc").build().is_err());
        probe.exit();

        let breakers = engine.degrade_rules().breakers("svc");
        assert_eq!(breakers[0].state(), State::Closed);
        assert_eq!(breakers[0].counts().total, 0);
        engine.entry("svc").build().unwrap().exit();
    }

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        order: i32,
        seen: Arc<Mutex<Vec<String>>>,
        deny: Option<&'static str>,
    }

    impl Slot for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn entry(&self, ctx: &mut SlotContext) -> Result<(), SlotError> {
            self.seen.lock().push(format!("entry:{}", self.name));
            if let Some(denied) = self.deny
                && ctx.arg(0) == Some(&ParamValue::from(denied))
            {
                return Err(BlockError::Custom {
                    resource: ctx.resource().name.clone(),
                    slot: self.name.to_string(),
                    message: format!("{denied} is not welcome"),
                }
                .into());
            }
            Ok(())
        }

        fn on_block(&self, _ctx: &mut SlotContext) {
            self.seen.lock().push(format!("block:{}", self.name));
        }

        fn exit(&self, _ctx: &mut SlotContext) {
            self.seen.lock().push(format!("exit:{}", self.name));
        }
    }

    fn recorder(
        name: &'static str,
        order: i32,
        seen: &Arc<Mutex<Vec<String>>>,
        deny: Option<&'static str>,
    ) -> SlotProvider {
        let seen = Arc::clone(seen);
        SlotProvider::new(
            name,
            order,
            Arc::new(move || {
                Arc::new(Recorder {
                    name,
                    order,
                    seen: Arc::clone(&seen),
                    deny,
                }) as Arc<dyn Slot>
            }),
        )
    }

    #[test]
    fn custom_slots_run_in_order_and_unwind_in_reverse() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut providers = ProviderRegistry::empty();
        providers.register_slot(recorder("second", 20, &seen, Some("mallory")));
        providers.register_slot(recorder("first", 10, &seen, None));
        providers.register_slot(recorder("third", 30, &seen, None));
        let engine = Engine::builder().providers(providers).build().unwrap();

        engine.entry("svc").with_arg("alice").build().unwrap().exit();
        assert_eq!(
            *seen.lock(),
            [
                "entry:first",
                "entry:second",
                "entry:third",
                "exit:third",
                "exit:second",
                "exit:first"
            ]
        );

        seen.lock().clear();
        let err = engine.entry("svc").with_arg("mallory").build().unwrap_err();
        assert!(matches!(err, BlockError::Custom { ref slot, .. } if slot == "second"));
        assert_eq!(
            *seen.lock(),
            [
                "entry:first",
                "entry:second",
                "block:second",
                "block:first",
                "exit:second",
                "exit:first"
            ]
        );
    }

    #[derive(Debug, Default)]
    struct Panicking;

    impl Slot for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn order(&self) -> i32 {
            FLOW_ORDER - 1
        }

        fn entry(&self, _ctx: &mut SlotContext) -> Result<(), SlotError> {
            panic!("slot bug");
        }
    }

    #[test]
    fn panicking_slot_is_treated_as_allow() {
        let engine = Engine::builder()
            .register_slot(SlotProvider::new(
                "panicking",
                FLOW_ORDER - 1,
                Arc::new(|| Arc::new(Panicking) as Arc<dyn Slot>),
            ))
            .build()
            .unwrap();
        engine.entry("svc").build().unwrap().exit();
    }

    #[test]
    fn prioritized_call_borrows_the_next_window() {
        let (engine, mock) = engine();
        engine
            .flow_rules()
            .load_rules(vec![FlowRule::new("svc", FlowGrade::Qps, 2.0)])
            .unwrap();
        engine.entry("svc").build().unwrap().exit();
        engine.entry("svc").build().unwrap().exit();
        mock.increment(Duration::from_millis(800));

        assert!(engine.entry("svc").build().is_err());
        let before = engine.time().now_ms();
        let entry = engine.entry("svc").prioritized().build().unwrap();
        assert!(entry.is_occupied());
        assert_eq!(engine.time().now_ms(), before + 200);
        entry.exit();
    }

    #[test]
    fn prioritized_call_still_meets_an_open_breaker() {
        let (engine, mock) = engine();
        engine
            .flow_rules()
            .load_rules(vec![FlowRule::new("svc", FlowGrade::Qps, 5.0)])
            .unwrap();
        engine
            .degrade_rules()
            .load_rules(vec![
                DegradeRule::new("svc", BreakerStrategy::ErrorCount { threshold: 1.0 })
                    .with_min_request_amount(1),
            ])
            .unwrap();
        for _ in 0..4 {
            engine.entry("svc").build().unwrap().exit();
        }
        let mut failing = engine.entry("svc").build().unwrap();
        failing.set_error("boom");
        failing.exit();
        assert_eq!(engine.degrade_rules().breakers("svc")[0].state(), State::Open);

        mock.increment(Duration::from_millis(700));
        let err = engine.entry("svc").prioritized().build().unwrap_err();
        assert!(err.is_circuit_open());

        // The borrowed pass was given back.
        let node = engine.registry().find_cluster_node("svc").unwrap();
        let minute = node.stat().minute_bucket_at(MOCK_EPOCH_MS).unwrap();
        assert_eq!(minute.pass, 5);
        assert_eq!(minute.occupied_pass, 0);
        mock.increment(Duration::from_millis(100));
        assert_eq!(node.stat().pass_qps(), 0.0);
        assert_eq!(node.stat().cur_thread_num(), 0);
    }

    #[test]
    fn authority_checks_the_context_origin() {
        let (engine, _mock) = engine();
        engine
            .authority_rules()
            .load_rules(vec![AuthorityRule::white("svc", &["web"])])
            .unwrap();

        let web = engine.enter("checkout", "web");
        engine.entry("svc").with_context(&web).build().unwrap().exit();

        let batch = engine.enter("checkout", "batch");
        let err = engine.entry("svc").with_context(&batch).build().unwrap_err();
        assert!(matches!(err, BlockError::Authority { ref origin, .. } if origin == "batch"));
        assert_eq!(batch.depth(), 0);

        // No origin, no check.
        engine.entry("svc").build().unwrap().exit();
    }

    #[test]
    fn system_rules_guard_inbound_traffic_only() {
        let (engine, _mock) = engine();
        engine
            .system_rules()
            .load_rules(vec![SystemRule {
                qps: 1.0,
                ..SystemRule::default()
            }])
            .unwrap();

        engine
            .entry("api")
            .with_entry_type(EntryType::In)
            .build()
            .unwrap()
            .exit();
        let err = engine
            .entry("api")
            .with_entry_type(EntryType::In)
            .build()
            .unwrap_err();
        assert!(matches!(err, BlockError::System { .. }));
        engine.entry("db").build().unwrap().exit();
    }

    #[test]
    fn hot_parameter_values_are_limited_separately() {
        let (engine, _mock) = engine();
        engine
            .param_flow_rules()
            .load_rules(vec![ParamFlowRule::new("svc", 0, FlowGrade::Qps, 1.0)])
            .unwrap();

        engine.entry("svc").with_arg("alice").build().unwrap().exit();
        let err = engine.entry("svc").with_arg("alice").build().unwrap_err();
        assert!(matches!(err, BlockError::ParamFlow { ref value, .. } if *value == ParamValue::from("alice")));
        engine.entry("svc").with_arg("bob").build().unwrap().exit();
        // Calls without the argument are not checked.
        engine.entry("svc").build().unwrap().exit();
    }

    #[test]
    fn nested_entries_build_a_call_tree() {
        let (engine, _mock) = engine();
        let context = engine.enter("checkout", "");
        let outer = engine.entry("outer").with_context(&context).build().unwrap();
        let inner = engine.entry("inner").with_context(&context).build().unwrap();
        assert_eq!(context.depth(), 2);

        let outer_node = outer.node().unwrap();
        let children = outer_node.children();
        assert_eq!(children.len(), 1);
        assert!(Arc::ptr_eq(&children[0], inner.node().unwrap()));

        inner.exit();
        outer.exit();
        assert_eq!(context.depth(), 0);
    }

    #[test]
    fn past_the_context_cap_entries_are_unchecked() {
        let (time, _mock) = TimeSource::mock();
        let config = EngineConfig {
            max_context_count: 1,
            ..EngineConfig::default()
        };
        let engine = Engine::builder()
            .config(config)
            .time_source(time)
            .build()
            .unwrap();
        engine
            .flow_rules()
            .load_rules(vec![FlowRule::new("svc", FlowGrade::Qps, 1.0)])
            .unwrap();

        assert!(!engine.enter("first", "").is_null());
        let overflow = engine.enter("second", "");
        assert!(overflow.is_null());
        for _ in 0..3 {
            let entry = engine.entry("svc").with_context(&overflow).build().unwrap();
            assert!(!entry.is_checked());
            entry.exit();
        }
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = EngineConfig {
            cold_factor: 1,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::builder().config(config).build(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}

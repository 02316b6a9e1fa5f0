//! A small JSON command surface for inspecting nodes and pushing rules.
//!
//! ```rust
//! use shot_guard::Engine;
//! use shot_guard::command::CommandCenter;
//!
//! let center = CommandCenter::new(Engine::builder().build().unwrap());
//! let reply = center.handle_json(r#"{ "command": "set_rules", "kind": "flow",
//!     "payload": [{ "resource": "orders", "grade": "qps", "count": 10.0 }] }"#);
//! assert_eq!(reply["success"], true);
//! ```

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::warn;

use crate::authority::AuthorityRule;
use crate::degrade::DegradeRule;
use crate::engine::Engine;
use crate::error::ConfigError;
use crate::flow::FlowRule;
use crate::node::ClusterNode;
use crate::node::DefaultNode;
use crate::node::StatisticNode;
use crate::param::ParamDegradeRule;
use crate::param::ParamFlowRule;
use crate::rule::LoadOutcome;
use crate::system::SystemRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Flow,
    Degrade,
    System,
    Authority,
    ParamFlow,
    ParamDegrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Per-second history of one resource, or live figures of all of them.
    Metrics {
        #[serde(default)]
        resource: Option<String>,
    },
    ClusterNodes,
    /// The call tree under every context entrance.
    Tree,
    GetRules {
        kind: RuleKind,
    },
    /// Replaces every rule of `kind` with `payload`, a JSON array.
    SetRules {
        kind: RuleKind,
        payload: Value,
    },
}

pub type CommandResponse = Value;

/// Answers [`Command`]s against one engine.
#[derive(Debug, Clone)]
pub struct CommandCenter {
    engine: Engine,
}

fn stat_json(stat: &StatisticNode) -> Value {
    json!({
        "pass_qps": stat.pass_qps(),
        "block_qps": stat.block_qps(),
        "total_qps": stat.total_qps(),
        "success_qps": stat.success_qps(),
        "exception_qps": stat.exception_qps(),
        "avg_rt": stat.avg_rt(),
        "threads": stat.cur_thread_num(),
    })
}

fn cluster_json(node: &ClusterNode) -> Value {
    let mut value = stat_json(node.stat());
    value["resource"] = json!(node.name());
    value["origins"] = node
        .origins()
        .into_iter()
        .map(|(origin, stat)| {
            let mut value = stat_json(&stat);
            value["origin"] = json!(origin);
            value
        })
        .collect();
    value
}

fn tree_json(node: &Arc<DefaultNode>, path: &mut Vec<*const DefaultNode>) -> Value {
    let mut value = stat_json(node.stat());
    value["resource"] = json!(node.id().name());
    // Recursive calls hang a node below itself.
    if path.contains(&Arc::as_ptr(node)) {
        value["children"] = json!([]);
        return value;
    }
    path.push(Arc::as_ptr(node));
    value["children"] = node
        .children()
        .iter()
        .map(|child| tree_json(child, path))
        .collect();
    path.pop();
    value
}

fn outcome_json(outcome: LoadOutcome) -> Value {
    json!({
        "success": true,
        "previous": outcome.previous,
        "current": outcome.current,
    })
}

impl CommandCenter {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// # Errors
    ///
    /// Rejected rule pushes and unknown resources.
    pub fn handle(&self, command: Command) -> Result<CommandResponse, ConfigError> {
        match command {
            Command::Metrics { resource: Some(resource) } => {
                let node = self
                    .engine
                    .registry()
                    .find_cluster_node(&resource)
                    .ok_or_else(|| ConfigError::rule(&resource, "no such resource"))?;
                Ok(json!({
                    "resource": resource,
                    "metrics": node.stat().metrics(),
                }))
            }
            Command::Metrics { resource: None } | Command::ClusterNodes => Ok(self
                .engine
                .registry()
                .cluster_nodes()
                .iter()
                .map(|node| cluster_json(node))
                .collect()),
            Command::Tree => Ok(self
                .engine
                .registry()
                .entrances()
                .iter()
                .map(|entrance| {
                    json!({
                        "context": entrance.name(),
                        "pass_qps": entrance.pass_qps(),
                        "block_qps": entrance.block_qps(),
                        "avg_rt": entrance.avg_rt(),
                        "threads": entrance.cur_thread_num(),
                        "children": entrance
                            .children()
                            .iter()
                            .map(|child| tree_json(child, &mut Vec::new()))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect()),
            Command::GetRules { kind } => self.get_rules(kind),
            Command::SetRules { kind, payload } => self.set_rules(kind, payload).map(outcome_json),
        }
    }

    /// Parses and runs one command. Failures come back as
    /// `{ "success": false, "error": ... }`.
    pub fn handle_json(&self, request: &str) -> CommandResponse {
        let result = serde_json::from_str::<Command>(request)
            .map_err(ConfigError::from)
            .and_then(|command| self.handle(command));
        match result {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "command failed");
                json!({ "success": false, "error": err.to_string() })
            }
        }
    }

    fn get_rules(&self, kind: RuleKind) -> Result<Value, ConfigError> {
        let engine = &self.engine;
        let rules = match kind {
            RuleKind::Flow => serde_json::to_value(engine.flow_rules().rules()),
            RuleKind::Degrade => serde_json::to_value(engine.degrade_rules().rules()),
            RuleKind::System => serde_json::to_value(engine.system_rules().rules()),
            RuleKind::Authority => serde_json::to_value(engine.authority_rules().rules()),
            RuleKind::ParamFlow => serde_json::to_value(engine.param_flow_rules().rules()),
            RuleKind::ParamDegrade => serde_json::to_value(engine.param_degrade_rules().rules()),
        };
        Ok(rules?)
    }

    fn set_rules(&self, kind: RuleKind, payload: Value) -> Result<LoadOutcome, ConfigError> {
        let engine = &self.engine;
        match kind {
            RuleKind::Flow => {
                let rules: Vec<FlowRule> = serde_json::from_value(payload)?;
                engine.flow_rules().load_rules(rules)
            }
            RuleKind::Degrade => {
                let rules: Vec<DegradeRule> = serde_json::from_value(payload)?;
                engine.degrade_rules().load_rules(rules)
            }
            RuleKind::System => {
                let rules: Vec<SystemRule> = serde_json::from_value(payload)?;
                engine.system_rules().load_rules(rules)
            }
            RuleKind::Authority => {
                let rules: Vec<AuthorityRule> = serde_json::from_value(payload)?;
                engine.authority_rules().load_rules(rules)
            }
            RuleKind::ParamFlow => {
                let rules: Vec<ParamFlowRule> = serde_json::from_value(payload)?;
                engine.param_flow_rules().load_rules(rules)
            }
            RuleKind::ParamDegrade => {
                let rules: Vec<ParamDegradeRule> = serde_json::from_value(payload)?;
                engine.param_degrade_rules().load_rules(rules)
            }
        }
    }
}
